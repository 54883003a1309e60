//! Programs discovered in the currently tuned transport stream.

use serde::{Deserialize, Serialize};

/// A single program (virtual sub-channel) found in the tuned stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelScanProgram {
    /// Program number inside the transport stream.
    pub program_number: u32,
    /// Guide name, when present.
    pub name: String,
    /// Virtual channel major number (e.g. the `7` of `7.2`).
    pub virtual_major: u32,
    /// Virtual channel minor number (e.g. the `2` of `7.2`).
    pub virtual_minor: u32,
}

impl ChannelScanProgram {
    pub fn new(program_number: u32, name: impl Into<String>, major: u32, minor: u32) -> Self {
        Self {
            program_number,
            name: name.into(),
            virtual_major: major,
            virtual_minor: minor,
        }
    }
}

/// Ordered sequence of programs, refreshed whenever stream info is read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramsList {
    programs: Vec<ChannelScanProgram>,
}

impl ProgramsList {
    pub fn new(programs: Vec<ChannelScanProgram>) -> Self {
        Self { programs }
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn push(&mut self, program: ChannelScanProgram) {
        self.programs.push(program);
    }

    /// Find a program by its program number.
    pub fn by_number(&self, program_number: u32) -> Option<&ChannelScanProgram> {
        self.programs
            .iter()
            .find(|p| p.program_number == program_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelScanProgram> {
        self.programs.iter()
    }
}

impl FromIterator<ChannelScanProgram> for ProgramsList {
    fn from_iter<T: IntoIterator<Item = ChannelScanProgram>>(iter: T) -> Self {
        Self {
            programs: iter.into_iter().collect(),
        }
    }
}
