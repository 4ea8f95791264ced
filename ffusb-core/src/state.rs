use core::fmt;

/// Machine state as inferred from status polls
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrinterState {
    #[default]
    Unknown,
    Ready,
    Building,
    SdBuilding,
    SdPaused,
    Homing,
    Busy,
    WaitOnTemp,
}

impl PrinterState {
    pub fn is_ready(self) -> bool {
        self == PrinterState::Ready
    }

    pub fn is_printing(self) -> bool {
        matches!(
            self,
            PrinterState::Building
                | PrinterState::SdBuilding
                | PrinterState::Homing
                | PrinterState::SdPaused
        )
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrinterState::Unknown => "unknown",
            PrinterState::Ready => "ready",
            PrinterState::Building => "building",
            PrinterState::SdBuilding => "building from SD",
            PrinterState::SdPaused => "SD print paused",
            PrinterState::Homing => "homing",
            PrinterState::Busy => "busy",
            PrinterState::WaitOnTemp => "waiting on temperature",
        };
        f.write_str(name)
    }
}

/// `MachineStatus:` token of a status poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Ready,
    Building,
    BuildingFromSd,
    BuildingCompleted,
    Paused,
    Busy,
    Other,
}

impl MachineStatus {
    pub fn from_token(token: &str) -> Self {
        match token {
            "READY" => MachineStatus::Ready,
            "BUILDING" => MachineStatus::Building,
            "BUILDING_FROM_SD" => MachineStatus::BuildingFromSd,
            "BUILDING_COMPLETED" => MachineStatus::BuildingCompleted,
            "PAUSED" => MachineStatus::Paused,
            "BUSY" => MachineStatus::Busy,
            _ => MachineStatus::Other,
        }
    }
}

/// `MoveMode:` token of a status poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMode {
    Ready,
    Moving,
    Paused,
    Homing,
    WaitOnTool,
    Other,
}

impl MoveMode {
    pub fn from_token(token: &str) -> Self {
        match token {
            "READY" => MoveMode::Ready,
            "MOVING" => MoveMode::Moving,
            "PAUSED" => MoveMode::Paused,
            "HOMING" => MoveMode::Homing,
            "WAIT_ON_TOOL" => MoveMode::WaitOnTool,
            _ => MoveMode::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub machine: MachineStatus,
    pub move_mode: MoveMode,
}

/// Next state for a decoded status poll
///
/// Unrecognized machine tokens leave the state where it was.
pub fn transition(previous: PrinterState, report: &StatusReport) -> PrinterState {
    use MachineStatus as M;
    use MoveMode as Mv;
    match (report.machine, report.move_mode) {
        (M::BuildingFromSd, Mv::Paused) | (M::Paused, _) => PrinterState::SdPaused,
        (M::BuildingFromSd, _) => PrinterState::SdBuilding,
        (M::Building, _) => PrinterState::Building,
        (M::BuildingCompleted, _) => PrinterState::Ready,
        (_, Mv::Homing) => PrinterState::Homing,
        (M::Ready, Mv::Ready) => PrinterState::Ready,
        (M::Ready, Mv::WaitOnTool) => PrinterState::WaitOnTemp,
        (M::Ready | M::Busy, _) => PrinterState::Busy,
        (M::Other, _) => previous,
    }
}

/// Current state plus the temperature report interval it drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: PrinterState,
    /// Interval requested by the host with `M155`, wins over the armed one
    host_interval: Option<u32>,
    armed_interval: u32,
    wait_interval: u32,
}

impl StateMachine {
    /// `wait_interval` is the report interval armed while waiting on heaters, in seconds
    pub fn new(wait_interval: u32) -> Self {
        Self {
            state: PrinterState::Unknown,
            host_interval: None,
            armed_interval: 0,
            wait_interval,
        }
    }

    pub fn state(&self) -> PrinterState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn is_printing(&self) -> bool {
        self.state.is_printing()
    }

    /// Feed a decoded status poll, returning the new state
    pub fn apply(&mut self, report: &StatusReport) -> PrinterState {
        let next = transition(self.state, report);
        if next != self.state {
            tracing::info!("Printer state {} -> {next}", self.state);
            self.armed_interval = if next == PrinterState::WaitOnTemp {
                self.wait_interval
            } else {
                0
            };
            self.state = next;
        }
        next
    }

    /// `None` or zero clears the host's request
    pub fn set_host_interval(&mut self, secs: Option<u32>) {
        self.host_interval = secs.filter(|secs| *secs > 0);
    }

    pub fn host_interval(&self) -> Option<u32> {
        self.host_interval
    }

    /// Seconds between synthesized temperature reports, zero when disabled
    pub fn report_interval(&self) -> u32 {
        self.host_interval.unwrap_or(self.armed_interval)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(0)
    }
}
