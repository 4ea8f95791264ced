use crate::{gcode::round4, response::PositionReport};

pub const EXTRUDERS: usize = 2;

/// An axis the host can move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
    /// Feed of the active extruder
    E,
}

impl Axis {
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'E' => Some(Axis::E),
            _ => None,
        }
    }
}

/// Last known absolute coordinates, tracked so relative moves can be rewritten as absolute ones
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PositionModel {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: [f64; EXTRUDERS],
    pub relative: bool,
    pub extruder: usize,
}

impl PositionModel {
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::E => self.e[self.extruder],
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        let value = round4(value);
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::E => self.e[self.extruder] = value,
        }
    }

    /// Move `axis` by `delta`, returning the new absolute coordinate
    pub fn offset(&mut self, axis: Axis, delta: f64) -> f64 {
        self.set(axis, self.get(axis) + delta);
        self.get(axis)
    }

    /// Out of range indices are ignored
    pub fn select_extruder(&mut self, index: usize) {
        if index < EXTRUDERS {
            self.extruder = index;
        } else {
            tracing::warn!("Ignoring selection of unsupported extruder T{index}");
        }
    }

    pub fn apply_report(&mut self, report: &PositionReport) {
        if let Some(x) = report.x {
            self.x = x;
        }
        if let Some(y) = report.y {
            self.y = y;
        }
        if let Some(z) = report.z {
            self.z = z;
        }
        if let Some(a) = report.a {
            self.e[0] = a;
        }
        if let Some(b) = report.b {
            self.e[1] = b;
        }
    }
}
