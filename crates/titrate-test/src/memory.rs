//! In-memory stand-ins for the kernel side
//!
//! Every fake hands out a cloneable probe sharing its state, so a test can
//! keep inspecting (and breaking) a record after the controller has taken
//! ownership of it.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use titrate_common::{
    AvgQueueState, BufferState, DatapathAttach, InterfaceResolver, KernelStateBridge, LinkHandle,
    RecordKind, RecordMap, ShaperError, ShaperResult, ShapingConfig, ThroughputStats,
};

#[derive(Debug)]
struct RecordCell<R> {
    value: R,
    fail_reads: bool,
    fail_writes: bool,
    reads: u64,
    writes: u64,
}

/// One singleton record held in memory.
pub struct MemoryRecord<R> {
    kind: RecordKind,
    cell: Arc<Mutex<RecordCell<R>>>,
}

/// Test-side handle onto a [`MemoryRecord`].
pub struct RecordProbe<R> {
    cell: Arc<Mutex<RecordCell<R>>>,
}

impl<R> Clone for RecordProbe<R> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

/// Creates a record holding `initial` and its probe.
pub fn memory_record<R: Copy + Send>(kind: RecordKind, initial: R) -> (MemoryRecord<R>, RecordProbe<R>) {
    let cell = Arc::new(Mutex::new(RecordCell {
        value: initial,
        fail_reads: false,
        fail_writes: false,
        reads: 0,
        writes: 0,
    }));
    (
        MemoryRecord {
            kind,
            cell: Arc::clone(&cell),
        },
        RecordProbe { cell },
    )
}

impl<R: Copy + Send> RecordMap<R> for MemoryRecord<R> {
    fn read(&self) -> ShaperResult<R> {
        let mut cell = self.cell.lock();
        if cell.fail_reads {
            return Err(ShaperError::state_read(self.kind, "injected read failure"));
        }
        cell.reads += 1;
        Ok(cell.value)
    }

    fn write(&mut self, value: &R) -> ShaperResult<()> {
        let mut cell = self.cell.lock();
        if cell.fail_writes {
            return Err(ShaperError::state_write(self.kind, "injected write failure"));
        }
        cell.writes += 1;
        cell.value = *value;
        Ok(())
    }
}

impl<R: Copy> RecordProbe<R> {
    /// Current value.
    pub fn get(&self) -> R {
        self.cell.lock().value
    }

    /// Overwrites the value, as the datapath would.
    pub fn set(&self, value: R) {
        self.cell.lock().value = value;
    }

    /// Mutates the value in place.
    pub fn update(&self, f: impl FnOnce(&mut R)) {
        f(&mut self.cell.lock().value);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.cell.lock().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.cell.lock().fail_writes = fail;
    }

    /// Successful reads so far.
    pub fn reads(&self) -> u64 {
        self.cell.lock().reads
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u64 {
        self.cell.lock().writes
    }
}

/// Probes for all four kernel records.
#[derive(Clone)]
pub struct KernelProbe {
    pub shaping_config: RecordProbe<ShapingConfig>,
    pub buffer_state: RecordProbe<BufferState>,
    pub throughput_stats: RecordProbe<ThroughputStats>,
    pub avg_queue_state: RecordProbe<AvgQueueState>,
}

/// Builds a [`KernelStateBridge`] over in-memory records.
pub fn memory_kernel() -> (KernelStateBridge, KernelProbe) {
    let (shaping_config, shaping_probe) = memory_record(
        RecordKind::ShapingConfig,
        ShapingConfig::Static {
            rate_bps: 0,
            threshold_mtu: 0,
        },
    );
    let (buffer_state, buffer_probe) =
        memory_record(RecordKind::BufferState, BufferState::default());
    let (throughput_stats, throughput_probe) =
        memory_record(RecordKind::ThroughputStats, ThroughputStats::default());
    let (avg_queue_state, avg_probe) =
        memory_record(RecordKind::AvgQueueState, AvgQueueState::default());

    let bridge = KernelStateBridge::new(
        Box::new(shaping_config),
        Box::new(buffer_state),
        Box::new(throughput_stats),
        Box::new(avg_queue_state),
    );
    (
        bridge,
        KernelProbe {
            shaping_config: shaping_probe,
            buffer_state: buffer_probe,
            throughput_stats: throughput_probe,
            avg_queue_state: avg_probe,
        },
    )
}

/// Resolver assigning indices 1, 2, 3, ... in order of first lookup.
#[derive(Default)]
pub struct StaticResolver {
    failing: HashSet<String>,
    seen: Mutex<Vec<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes lookups of `name` fail.
    pub fn failing(mut self, name: impl Into<String>) -> Self {
        self.failing.insert(name.into());
        self
    }
}

impl InterfaceResolver for StaticResolver {
    fn resolve(&self, name: &str) -> ShaperResult<u32> {
        if self.failing.contains(name) {
            return Err(ShaperError::interface_not_found(name, "No such device"));
        }
        let mut seen = self.seen.lock();
        let position = match seen.iter().position(|n| n == name) {
            Some(position) => position,
            None => {
                seen.push(name.to_string());
                seen.len() - 1
            }
        };
        Ok(position as u32 + 1)
    }
}

/// Calls observed by [`FakeDatapath`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapathEvent {
    Allow { if_index: u32 },
    Attach { interface: String, handle: LinkHandle },
    Detach { interface: String, handle: LinkHandle },
}

#[derive(Default)]
struct DatapathState {
    events: Vec<DatapathEvent>,
    allowed: Vec<u32>,
    live: HashSet<LinkHandle>,
    next_handle: u64,
    fail_allow: HashSet<u32>,
    fail_attach: HashSet<String>,
    fail_detach: HashSet<String>,
}

/// Attach backend recording every call. Clones share state.
#[derive(Clone, Default)]
pub struct FakeDatapath {
    state: Arc<Mutex<DatapathState>>,
}

impl FakeDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_allow(&self, if_index: u32) {
        self.state.lock().fail_allow.insert(if_index);
    }

    pub fn fail_attach(&self, interface: impl Into<String>) {
        self.state.lock().fail_attach.insert(interface.into());
    }

    pub fn fail_detach(&self, interface: impl Into<String>) {
        self.state.lock().fail_detach.insert(interface.into());
    }

    /// Every call so far.
    pub fn events(&self) -> Vec<DatapathEvent> {
        self.state.lock().events.clone()
    }

    /// Indices written to the allow-list.
    pub fn allowed(&self) -> Vec<u32> {
        self.state.lock().allowed.clone()
    }

    /// Attachments not yet detached.
    pub fn live_links(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl DatapathAttach for FakeDatapath {
    fn allow(&mut self, if_index: u32) -> ShaperResult<()> {
        let mut state = self.state.lock();
        state.events.push(DatapathEvent::Allow { if_index });
        if state.fail_allow.contains(&if_index) {
            return Err(ShaperError::allow_list_write(if_index, "E2BIG"));
        }
        state.allowed.push(if_index);
        Ok(())
    }

    fn attach(&mut self, interface: &str, _if_index: u32) -> ShaperResult<LinkHandle> {
        let mut state = self.state.lock();
        if state.fail_attach.contains(interface) {
            return Err(ShaperError::attach(interface, "Device or resource busy"));
        }
        let handle = LinkHandle(state.next_handle);
        state.next_handle += 1;
        state.live.insert(handle);
        state.events.push(DatapathEvent::Attach {
            interface: interface.to_string(),
            handle,
        });
        Ok(handle)
    }

    fn detach(&mut self, interface: &str, handle: LinkHandle) -> ShaperResult<()> {
        let mut state = self.state.lock();
        state.events.push(DatapathEvent::Detach {
            interface: interface.to_string(),
            handle,
        });
        if state.fail_detach.contains(interface) {
            return Err(ShaperError::detach(interface, "No such device"));
        }
        if !state.live.remove(&handle) {
            return Err(ShaperError::detach(interface, "link already released"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    buffer: Vec<u8>,
    fail_writes: bool,
    flushes: u64,
}

/// In-memory telemetry sink. Clones share the buffer.
#[derive(Clone, Default)]
pub struct SharedSink {
    state: Arc<Mutex<SinkState>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail with `BrokenPipe`.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().buffer).into_owned()
    }

    /// Complete lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .split_terminator('\n')
            .map(str::to_string)
            .collect()
    }

    pub fn flushes(&self) -> u64 {
        self.state.lock().flushes
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"));
        }
        state.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }
}
