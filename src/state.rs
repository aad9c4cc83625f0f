/// One battery cell within a module.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Position within the module, 1..=6
    pub id: u8,
    /// The measured voltage in V. `None` when no reading was received for
    /// this position, or when the reading fell outside the valid range.
    pub voltage: Option<f32>,
    /// True exactly when a reading was received but rejected as
    /// physically invalid. A missing reading is not critical.
    pub is_critical: bool,
}

impl Cell {
    /// A cell position for which no data has been received.
    pub fn empty(id: u8) -> Self {
        Self {
            id,
            voltage: None,
            is_critical: false,
        }
    }
}

/// A physical group of six cells, addressed by a fixed offset scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Module id, the offset of its frame address from the module base.
    pub id: u8,
    /// Always exactly six cells, in position order.
    pub cells: [Cell; 6],
}

/// Statistics derived over every present cell voltage across all modules.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageStats {
    /// The highest cell voltage in V
    pub max_voltage: f32,
    /// The lowest cell voltage in V
    pub min_voltage: f32,
    /// max - min, in V. Never negative.
    pub voltage_diff: f32,
    /// Local wall-clock time of the last recompute, HH:MM:SS
    pub last_update: String,
}

/// Connection lifecycle of the monitor. `Monitoring` is the connected,
/// data-flowing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Configuring,
    Monitoring,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Configuring => "configuring",
            ConnectionState::Monitoring => "monitoring",
        };
        f.write_str(s)
    }
}

/// Immutable view of the pack published to subscribers after every change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PackSnapshot {
    /// All known modules, ordered by id.
    pub modules: Vec<Module>,
    /// `None` until at least one valid cell voltage has been seen.
    pub stats: Option<VoltageStats>,
}

/// Out-of-band notifications for presentation collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    StateChanged(ConnectionState),
    /// A human-readable failure description. Each new fault overwrites
    /// whatever the subscriber was showing before.
    Fault(String),
}
