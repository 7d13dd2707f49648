//! Interface Attachment Manager.
//!
//! Resolves configured names, allow-lists them and attaches the datapath
//! program. Individual interface failures are logged and skipped; only a
//! run with zero successful attachments is fatal.

use tracing::{info, warn};

use titrate_common::{DatapathAttach, InterfaceResolver, LinkHandle, ShaperError, ShaperResult};

/// Splits a comma-separated interface list, trimming each entry and
/// dropping blanks.
pub fn parse_interface_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// A live program attachment on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAttachment {
    pub name: String,
    pub if_index: u32,
    pub handle: LinkHandle,
}

/// Outcome of [`AttachmentManager::release_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub released: usize,
    pub failed: usize,
}

/// Tracks attachments made through a datapath backend.
pub struct AttachmentManager<D> {
    datapath: D,
    attachments: Vec<InterfaceAttachment>,
}

impl<D: DatapathAttach> AttachmentManager<D> {
    pub fn new(datapath: D) -> Self {
        Self {
            datapath,
            attachments: Vec::new(),
        }
    }

    /// Current attachments, in attach order.
    pub fn attachments(&self) -> &[InterfaceAttachment] {
        &self.attachments
    }

    /// Attaches to every non-blank name in `interfaces`.
    ///
    /// Names are trimmed; blank entries are skipped silently. Returns the
    /// number of new attachments, or [`ShaperError::NoInterfacesAttached`]
    /// when none succeeded.
    pub fn attach_all(
        &mut self,
        resolver: &dyn InterfaceResolver,
        interfaces: &[String],
    ) -> ShaperResult<usize> {
        let mut requested = 0;
        let mut attached = 0;

        for name in interfaces.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            requested += 1;
            match self.attach_one(resolver, name) {
                Ok(attachment) => {
                    info!(
                        interface = %attachment.name,
                        if_index = attachment.if_index,
                        "Attached XDP program"
                    );
                    self.attachments.push(attachment);
                    attached += 1;
                }
                Err(e) => {
                    warn!(interface = %name, error = %e, "Skipping interface");
                }
            }
        }

        if attached == 0 {
            return Err(ShaperError::NoInterfacesAttached { requested });
        }
        if attached < requested {
            warn!(attached, requested, "Attached to a subset of interfaces");
        }
        Ok(attached)
    }

    fn attach_one(
        &mut self,
        resolver: &dyn InterfaceResolver,
        name: &str,
    ) -> ShaperResult<InterfaceAttachment> {
        let if_index = resolver.resolve(name)?;
        self.datapath.allow(if_index)?;
        let handle = self.datapath.attach(name, if_index)?;
        Ok(InterfaceAttachment {
            name: name.to_string(),
            if_index,
            handle,
        })
    }

    /// Releases every recorded attachment exactly once.
    ///
    /// Release errors are logged and counted, never returned. The manager is
    /// empty afterwards, so a second call is a no-op.
    pub fn release_all(&mut self) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();
        for attachment in self.attachments.drain(..).rev() {
            match self.datapath.detach(&attachment.name, attachment.handle) {
                Ok(()) => {
                    info!(interface = %attachment.name, "Detached XDP program");
                    summary.released += 1;
                }
                Err(e) => {
                    warn!(interface = %attachment.name, error = %e, "Detach failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use titrate_test::{DatapathEvent, FakeDatapath, StaticResolver};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_interface_list() {
        assert_eq!(
            parse_interface_list("enX0, enX1,,  ,enX3 "),
            names(&["enX0", "enX1", "enX3"])
        );
        assert!(parse_interface_list(" , ").is_empty());
    }

    #[test]
    fn test_skips_blank_and_unresolvable() {
        let datapath = FakeDatapath::new();
        let resolver = StaticResolver::new().failing("bad-if");
        let mut manager = AttachmentManager::new(datapath.clone());

        let attached = manager
            .attach_all(&resolver, &names(&["eth0", "", " eth1 ", "bad-if"]))
            .unwrap();

        assert_eq!(attached, 2);
        let attached_names: Vec<&str> =
            manager.attachments().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(attached_names, vec!["eth0", "eth1"]);
        assert_eq!(datapath.allowed(), vec![1, 2]);
    }

    #[test]
    fn test_zero_attachments_is_fatal() {
        let datapath = FakeDatapath::new();
        let resolver = StaticResolver::new().failing("a").failing("b");
        let mut manager = AttachmentManager::new(datapath.clone());

        let err = manager
            .attach_all(&resolver, &names(&["a", "b"]))
            .unwrap_err();
        assert!(matches!(err, ShaperError::NoInterfacesAttached { requested: 2 }));
        assert!(err.is_fatal());
        assert!(datapath.events().is_empty());
    }

    #[test]
    fn test_all_blank_requests_nothing() {
        let mut manager = AttachmentManager::new(FakeDatapath::new());
        let err = manager
            .attach_all(&StaticResolver::new(), &names(&["", "  "]))
            .unwrap_err();
        assert!(matches!(err, ShaperError::NoInterfacesAttached { requested: 0 }));
    }

    #[test]
    fn test_attach_failure_is_skipped() {
        let datapath = FakeDatapath::new();
        datapath.fail_attach("eth1");
        let mut manager = AttachmentManager::new(datapath.clone());

        let attached = manager
            .attach_all(&StaticResolver::new(), &names(&["eth0", "eth1"]))
            .unwrap();
        assert_eq!(attached, 1);
        // eth1 was allow-listed before its attach failed
        assert_eq!(datapath.allowed(), vec![1, 2]);
        assert_eq!(datapath.live_links(), 1);
    }

    #[test]
    fn test_release_each_handle_once() {
        let datapath = FakeDatapath::new();
        datapath.fail_detach("eth1");
        let mut manager = AttachmentManager::new(datapath.clone());
        manager
            .attach_all(&StaticResolver::new(), &names(&["eth0", "eth1", "eth2"]))
            .unwrap();

        let summary = manager.release_all();
        assert_eq!(
            summary,
            ReleaseSummary {
                released: 2,
                failed: 1
            }
        );
        assert_eq!(manager.release_all(), ReleaseSummary::default());

        let detaches = datapath
            .events()
            .into_iter()
            .filter(|e| matches!(e, DatapathEvent::Detach { .. }))
            .count();
        assert_eq!(detaches, 3);
    }

    #[test]
    fn test_allow_list_failure_is_skipped() {
        let datapath = FakeDatapath::new();
        datapath.fail_allow(2);
        let mut manager = AttachmentManager::new(datapath.clone());

        let attached = manager
            .attach_all(&StaticResolver::new(), &names(&["eth0", "eth1", "eth2"]))
            .unwrap();

        assert_eq!(attached, 2);
        assert_eq!(datapath.allowed(), vec![1, 3]);
        let attached_names: Vec<&str> =
            manager.attachments().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(attached_names, vec!["eth0", "eth2"]);
        assert!(!datapath.events().iter().any(|e| matches!(
            e,
            DatapathEvent::Attach { interface, .. } if interface == "eth1"
        )));
        assert_eq!(datapath.live_links(), 2);
    }
}
