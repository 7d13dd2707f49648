//! aya-backed datapath.
//!
//! Loads the compiled XDP object, binds the singleton array maps to the
//! kernel record types and attaches the program in generic (skb) mode.
//! Wire structs mirror the datapath's C structs field for field.

use std::collections::HashMap as StdHashMap;
use std::path::Path;

use aya::maps::{Array, HashMap, Map, MapData};
use aya::programs::{xdp::XdpLinkId, Xdp, XdpFlags};
use aya::{Bpf, Pod};
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use tracing::{debug, info, warn};

use titrate_common::{
    AdaptiveParams, AdaptiveThreshold, AvgQueueState, BufferState, DatapathAttach,
    InterfaceResolver, KernelStateBridge, LinkHandle, RecordKind, RecordMap, ShaperError,
    ShaperResult, ShapingConfig, ThroughputStats,
};

use crate::config::PolicyKind;

const ALLOWED_INTERFACES_MAP: &str = "allowed_interfaces";
const RECORD_KEY: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct StaticParams {
    rate_bps: u64,
    threshold_mtu: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct TitrateParams {
    rate_bps: u64,
    window_duration_ms: u64,
    decrease_constant: u64,
    min_threshold_mtu: u64,
    max_threshold_mtu: u64,
    initial_threshold_mtu: u64,
    windows_considered: u64,
    ssthresh_multiplier: u64,
    ssthresh_enabled: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct StaticBufferState {
    current_buffer_bits: u64,
    last_update_ns: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct TitrateBufferState {
    current_buffer_bits: u64,
    last_update_ns: u64,
    current_threshold_mtu: u64,
    ssthresh_mtu: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct ThroughputStatsWire {
    program_start_ns: u64,
    total_zero_buffer_ns: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AvgQueueWire {
    avg_queue_bits: u64,
}

const _: () = assert!(std::mem::size_of::<StaticParams>() == 16);
const _: () = assert!(std::mem::size_of::<TitrateParams>() == 72);
const _: () = assert!(std::mem::size_of::<StaticBufferState>() == 16);
const _: () = assert!(std::mem::size_of::<TitrateBufferState>() == 32);
const _: () = assert!(std::mem::size_of::<ThroughputStatsWire>() == 16);
const _: () = assert!(std::mem::size_of::<AvgQueueWire>() == 8);

unsafe impl Pod for StaticParams {}
unsafe impl Pod for TitrateParams {}
unsafe impl Pod for StaticBufferState {}
unsafe impl Pod for TitrateBufferState {}
unsafe impl Pod for ThroughputStatsWire {}
unsafe impl Pod for AvgQueueWire {}

/// Conversion between a record and its datapath byte layout.
trait WireRecord<R>: Pod {
    const KIND: RecordKind;

    /// Fails when `value` cannot be represented by this layout.
    fn encode(value: &R) -> Result<Self, String>;

    fn decode(self) -> R;
}

impl WireRecord<ShapingConfig> for StaticParams {
    const KIND: RecordKind = RecordKind::ShapingConfig;

    fn encode(value: &ShapingConfig) -> Result<Self, String> {
        match value {
            ShapingConfig::Static {
                rate_bps,
                threshold_mtu,
            } => Ok(Self {
                rate_bps: *rate_bps,
                threshold_mtu: *threshold_mtu,
            }),
            ShapingConfig::Adaptive { .. } => {
                Err("adaptive parameters given to the static datapath".to_string())
            }
        }
    }

    fn decode(self) -> ShapingConfig {
        ShapingConfig::Static {
            rate_bps: self.rate_bps,
            threshold_mtu: self.threshold_mtu,
        }
    }
}

impl WireRecord<ShapingConfig> for TitrateParams {
    const KIND: RecordKind = RecordKind::ShapingConfig;

    fn encode(value: &ShapingConfig) -> Result<Self, String> {
        match value {
            ShapingConfig::Adaptive { rate_bps, params } => Ok(Self {
                rate_bps: *rate_bps,
                window_duration_ms: params.window_duration_ms,
                decrease_constant: params.decrease_constant,
                min_threshold_mtu: params.min_threshold_mtu,
                max_threshold_mtu: params.max_threshold_mtu,
                initial_threshold_mtu: params.initial_threshold_mtu,
                windows_considered: params.windows_considered,
                ssthresh_multiplier: params.ssthresh_multiplier,
                ssthresh_enabled: u64::from(params.ssthresh_enabled),
            }),
            ShapingConfig::Static { .. } => {
                Err("static parameters given to the titrate datapath".to_string())
            }
        }
    }

    fn decode(self) -> ShapingConfig {
        ShapingConfig::Adaptive {
            rate_bps: self.rate_bps,
            params: AdaptiveParams {
                window_duration_ms: self.window_duration_ms,
                decrease_constant: self.decrease_constant,
                min_threshold_mtu: self.min_threshold_mtu,
                max_threshold_mtu: self.max_threshold_mtu,
                initial_threshold_mtu: self.initial_threshold_mtu,
                windows_considered: self.windows_considered,
                ssthresh_multiplier: self.ssthresh_multiplier,
                ssthresh_enabled: self.ssthresh_enabled != 0,
            },
        }
    }
}

impl WireRecord<BufferState> for StaticBufferState {
    const KIND: RecordKind = RecordKind::BufferState;

    fn encode(value: &BufferState) -> Result<Self, String> {
        Ok(Self {
            current_buffer_bits: value.current_buffer_bits,
            last_update_ns: value.last_update_ns,
        })
    }

    fn decode(self) -> BufferState {
        BufferState {
            current_buffer_bits: self.current_buffer_bits,
            last_update_ns: self.last_update_ns,
            adaptive: None,
        }
    }
}

impl WireRecord<BufferState> for TitrateBufferState {
    const KIND: RecordKind = RecordKind::BufferState;

    fn encode(value: &BufferState) -> Result<Self, String> {
        let threshold = value.adaptive.unwrap_or_default();
        Ok(Self {
            current_buffer_bits: value.current_buffer_bits,
            last_update_ns: value.last_update_ns,
            current_threshold_mtu: threshold.current_threshold_mtu,
            ssthresh_mtu: threshold.ssthresh_mtu,
        })
    }

    fn decode(self) -> BufferState {
        BufferState {
            current_buffer_bits: self.current_buffer_bits,
            last_update_ns: self.last_update_ns,
            adaptive: Some(AdaptiveThreshold {
                current_threshold_mtu: self.current_threshold_mtu,
                ssthresh_mtu: self.ssthresh_mtu,
            }),
        }
    }
}

impl WireRecord<ThroughputStats> for ThroughputStatsWire {
    const KIND: RecordKind = RecordKind::ThroughputStats;

    fn encode(value: &ThroughputStats) -> Result<Self, String> {
        Ok(Self {
            program_start_ns: value.program_start_ns,
            total_zero_buffer_ns: value.total_zero_buffer_ns,
        })
    }

    fn decode(self) -> ThroughputStats {
        ThroughputStats {
            program_start_ns: self.program_start_ns,
            total_zero_buffer_ns: self.total_zero_buffer_ns,
        }
    }
}

impl WireRecord<AvgQueueState> for AvgQueueWire {
    const KIND: RecordKind = RecordKind::AvgQueueState;

    fn encode(value: &AvgQueueState) -> Result<Self, String> {
        Ok(Self {
            avg_queue_bits: value.avg_queue_bits,
        })
    }

    fn decode(self) -> AvgQueueState {
        AvgQueueState {
            avg_queue_bits: self.avg_queue_bits,
        }
    }
}

/// One singleton record backed by a one-entry BPF array.
struct AyaRecord<W: Pod> {
    array: Array<MapData, W>,
}

impl<W: Pod> AyaRecord<W> {
    fn open(map: Map, record: RecordKind) -> ShaperResult<Self> {
        let array = Array::try_from(map)
            .map_err(|e| ShaperError::load(format!("map {}: {}", record, e)))?;
        Ok(Self { array })
    }
}

impl<R, W> RecordMap<R> for AyaRecord<W>
where
    W: WireRecord<R> + Send + Sync,
{
    fn read(&self) -> ShaperResult<R> {
        self.array
            .get(&RECORD_KEY, 0)
            .map(W::decode)
            .map_err(|e| ShaperError::state_read(W::KIND, e))
    }

    fn write(&mut self, value: &R) -> ShaperResult<()> {
        let wire = W::encode(value).map_err(|e| ShaperError::state_write(W::KIND, e))?;
        self.array
            .set(RECORD_KEY, wire, 0)
            .map_err(|e| ShaperError::state_write(W::KIND, e))
    }
}

/// Resolves names with `if_nametoindex(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl InterfaceResolver for SystemResolver {
    fn resolve(&self, name: &str) -> ShaperResult<u32> {
        nix::net::if_::if_nametoindex(name)
            .map_err(|e| ShaperError::interface_not_found(name, e))
    }
}

/// Loaded datapath object: program, allow-list and live links.
pub struct AyaDatapath {
    bpf: Bpf,
    program: &'static str,
    allowed: HashMap<MapData, u32, u8>,
    links: StdHashMap<LinkHandle, XdpLinkId>,
    next_handle: u64,
}

impl AyaDatapath {
    fn xdp(&mut self) -> ShaperResult<&mut Xdp> {
        let program = self.program;
        self.bpf
            .program_mut(program)
            .ok_or_else(|| ShaperError::load(format!("program {program} not found")))?
            .try_into()
            .map_err(ShaperError::load)
    }
}

impl DatapathAttach for AyaDatapath {
    fn allow(&mut self, if_index: u32) -> ShaperResult<()> {
        self.allowed
            .insert(if_index, 1u8, 0)
            .map_err(|e| ShaperError::allow_list_write(if_index, e))
    }

    fn attach(&mut self, interface: &str, _if_index: u32) -> ShaperResult<LinkHandle> {
        let link = self
            .xdp()?
            .attach(interface, XdpFlags::SKB_MODE)
            .map_err(|e| ShaperError::attach(interface, e))?;

        let handle = LinkHandle(self.next_handle);
        self.next_handle += 1;
        self.links.insert(handle, link);
        Ok(handle)
    }

    fn detach(&mut self, interface: &str, handle: LinkHandle) -> ShaperResult<()> {
        let link = self
            .links
            .remove(&handle)
            .ok_or_else(|| ShaperError::detach(interface, "unknown link handle"))?;
        self.xdp()?
            .detach(link)
            .map_err(|e| ShaperError::detach(interface, e))
    }
}

/// Lifts the memlock rlimit so map creation is not capped on older kernels.
fn raise_memlock_limit() {
    if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        warn!(error = %e, "Failed to remove memlock limit");
    }
}

fn take_map(bpf: &mut Bpf, name: &str) -> ShaperResult<Map> {
    bpf.take_map(name)
        .ok_or_else(|| ShaperError::load(format!("map {name} not found")))
}

fn record<R, W>(bpf: &mut Bpf) -> ShaperResult<Box<dyn RecordMap<R>>>
where
    R: 'static,
    W: WireRecord<R> + Send + Sync + 'static,
{
    let map = take_map(bpf, W::KIND.map_name())?;
    Ok(Box::new(AyaRecord::<W>::open(map, W::KIND)?))
}

/// Loads `object` for `policy` and binds its maps.
///
/// Returns the record bridge and the attach backend. Nothing is attached
/// yet.
pub fn load(object: &Path, policy: PolicyKind) -> ShaperResult<(KernelStateBridge, AyaDatapath)> {
    raise_memlock_limit();

    let mut bpf = Bpf::load_file(object).map_err(|e| {
        ShaperError::load(format!("{}: {}", object.display(), e))
    })?;
    debug!(object = %object.display(), "Datapath object loaded");

    let program = policy.program_name();
    let xdp: &mut Xdp = bpf
        .program_mut(program)
        .ok_or_else(|| ShaperError::load(format!("program {program} not found")))?
        .try_into()
        .map_err(ShaperError::load)?;
    xdp.load().map_err(ShaperError::load)?;

    let allowed = HashMap::try_from(take_map(&mut bpf, ALLOWED_INTERFACES_MAP)?)
        .map_err(|e| ShaperError::load(format!("map {ALLOWED_INTERFACES_MAP}: {e}")))?;

    let bridge = match policy {
        PolicyKind::Static => KernelStateBridge::new(
            record::<ShapingConfig, StaticParams>(&mut bpf)?,
            record::<BufferState, StaticBufferState>(&mut bpf)?,
            record::<ThroughputStats, ThroughputStatsWire>(&mut bpf)?,
            record::<AvgQueueState, AvgQueueWire>(&mut bpf)?,
        ),
        PolicyKind::Titrate => KernelStateBridge::new(
            record::<ShapingConfig, TitrateParams>(&mut bpf)?,
            record::<BufferState, TitrateBufferState>(&mut bpf)?,
            record::<ThroughputStats, ThroughputStatsWire>(&mut bpf)?,
            record::<AvgQueueState, AvgQueueWire>(&mut bpf)?,
        ),
    };

    info!(program, object = %object.display(), "Datapath ready");
    Ok((
        bridge,
        AyaDatapath {
            bpf,
            program,
            allowed,
            links: StdHashMap::new(),
            next_handle: 0,
        },
    ))
}
