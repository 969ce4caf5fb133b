use ahash::{AHashMap, AHashSet};

use crate::protocol::{MessageReader, ProtocolResult};
use crate::session::{file_name_from_source, pack_token};

/// Armed breakpoints plus the server's script name to file id table.
#[derive(Debug, Default)]
pub struct Breakpoints {
    armed: AHashSet<u32>,
    files: AHashMap<String, u16>,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.armed.clear();
        self.files.clear();
    }

    pub fn is_armed(&self, token: u32) -> bool {
        self.armed.contains(&token)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    pub fn file_id(&self, name: &str) -> Option<u16> {
        self.files.get(name).copied()
    }

    pub fn set_file(&mut self, name: String, id: u16) {
        self.files.insert(name, id);
    }

    pub fn arm(&mut self, token: u32) {
        self.armed.insert(token);
    }

    pub fn disarm(&mut self, token: u32) {
        self.armed.remove(&token);
    }

    /// Applies a `SetBreakpoints` body: a file count, that many
    /// `(name, u16 id)` pairs, then `(u32 token, u8 enable)` pairs until the
    /// body ends.
    pub fn apply(&mut self, reader: &mut MessageReader<'_>) -> ProtocolResult<()> {
        let files = reader.read_u32()?;
        for _ in 0..files {
            let name = reader.read_string()?;
            let id = reader.read_u16()?;
            self.set_file(name, id);
        }
        while reader.has_data() {
            let token = reader.read_u32()?;
            if reader.read_bool()? {
                self.arm(token);
            } else {
                self.disarm(token);
            }
        }
        Ok(())
    }

    /// Token for a line in a chunk. When the server has no id for the
    /// chunk, the id is 0 and the script name is returned so it can be sent
    /// alongside.
    pub fn token_for<'s>(&self, source: Option<&'s str>, line: i32) -> (u32, Option<&'s str>) {
        let line = u16::try_from(line.max(0)).unwrap_or(u16::MAX);
        let Some(name) = source.and_then(file_name_from_source) else {
            return (pack_token(line, 0), None);
        };
        match self.file_id(name) {
            Some(id) => (pack_token(line, id), None),
            None => (pack_token(line, 0), Some(name)),
        }
    }
}
