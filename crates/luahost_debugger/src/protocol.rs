// Wire format shared with the debugger server.
//
// Every frame is `u32 body size, u32 tag, body`, all little endian. Strings
// are a `u32` length followed by UTF-8 bytes with no terminator.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const DEBUGGER_PORT: u16 = 25762;
pub const PROTOCOL_VERSION: u32 = 3;
pub const CONNECT_MAGIC: u32 = 0x75e7_498f;

/// Larger bodies are treated as a corrupt stream.
pub const MAX_MESSAGE_SIZE: usize = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("debugger connection: {0}")]
    Io(#[from] io::Error),
    #[error("message body of {0} bytes exceeds the protocol maximum")]
    Oversize(usize),
    #[error("message body ended before the expected field")]
    Truncated,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientTag {
    AskBreakpoints = 0,
    BreakAt = 1,
    Frame = 2,
    GetChildren = 3,
    Heartbeat = 4,
    SetVariable = 5,
    Sync = 6,
    Version = 7,
    Watch = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerTag {
    AddWatch = 0,
    Break = 1,
    Continue = 2,
    GetFrame = 3,
    GetChildren = 4,
    RemoveWatch = 5,
    SetBreakpoints = 6,
    SetVariable = 7,
    StepInto = 8,
    StepOut = 9,
    StepOver = 10,
}

impl ServerTag {
    pub fn from_u32(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::AddWatch,
            1 => Self::Break,
            2 => Self::Continue,
            3 => Self::GetFrame,
            4 => Self::GetChildren,
            5 => Self::RemoveWatch,
            6 => Self::SetBreakpoints,
            7 => Self::SetVariable,
            8 => Self::StepInto,
            9 => Self::StepOut,
            10 => Self::StepOver,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SuspendReason {
    Unknown = 0,
    Breakpoint = 1,
    Watch = 2,
    Fault = 3,
    StopRequest = 4,
    Step = 5,
    HaltOpcode = 6,
    ScriptLoaded = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum VariableType {
    Nil = 0,
    Boolean = 1,
    LightUserData = 2,
    Number = 3,
    String = 4,
    Table = 5,
    Function = 6,
    UserData = 7,
    Thread = 8,
    EmptyTable = 9,
}

impl VariableType {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Nil,
            1 => Self::Boolean,
            2 => Self::LightUserData,
            3 => Self::Number,
            4 => Self::String,
            5 => Self::Table,
            6 => Self::Function,
            7 => Self::UserData,
            8 => Self::Thread,
            9 => Self::EmptyTable,
            _ => return None,
        })
    }
}

/// One entry of a Frame or GetChildren reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub kind: VariableType,
    pub extended_type: String,
    pub value: String,
}

/// A tagged message body, built for sending or received for reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn client(tag: ClientTag) -> Self {
        Self {
            tag: tag as u32,
            body: Vec::new(),
        }
    }

    pub fn server(tag: ServerTag) -> Self {
        Self {
            tag: tag as u32,
            body: Vec::new(),
        }
    }

    pub fn version() -> Self {
        let mut message = Self::client(ClientTag::Version);
        message.write_u32(PROTOCOL_VERSION).write_u32(CONNECT_MAGIC);
        message
    }

    pub fn server_tag(&self) -> Option<ServerTag> {
        ServerTag::from_u32(self.tag)
    }

    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader {
            cursor: Cursor::new(&self.body),
        }
    }

    // Writes into a Vec cannot fail.

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        let _ = self.body.write_u16::<LittleEndian>(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        let _ = self.body.write_u32::<LittleEndian>(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        let _ = self.body.write_i32::<LittleEndian>(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.body.push(u8::from(v));
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_u32(s.len() as u32);
        self.body.extend_from_slice(s.as_bytes());
        self
    }

    pub fn write_variable(&mut self, info: &VariableInfo) -> &mut Self {
        self.write_str(&info.name)
            .write_i32(info.kind as i32)
            .write_str(&info.extended_type)
            .write_str(&info.value)
    }
}

pub struct MessageReader<'a> {
    cursor: Cursor<&'a Vec<u8>>,
}

impl MessageReader<'_> {
    pub fn has_data(&self) -> bool {
        (self.cursor.position() as usize) < self.cursor.get_ref().len()
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        self.cursor.read_u8().map_err(|_| ProtocolError::Truncated)
    }

    pub fn read_u16(&mut self) -> ProtocolResult<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| ProtocolError::Truncated)
    }

    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| ProtocolError::Truncated)
    }

    pub fn read_i32(&mut self) -> ProtocolResult<i32> {
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| ProtocolError::Truncated)
    }

    pub fn read_bool(&mut self) -> ProtocolResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_string(&mut self) -> ProtocolResult<String> {
        let len = self.read_u32()? as usize;
        let start = self.cursor.position() as usize;
        let bytes = self
            .cursor
            .get_ref()
            .get(start..start.saturating_add(len))
            .ok_or(ProtocolError::Truncated)?;
        let s = String::from_utf8_lossy(bytes).into_owned();
        self.cursor.set_position((start + len) as u64);
        Ok(s)
    }

    pub fn read_variable(&mut self) -> ProtocolResult<VariableInfo> {
        let name = self.read_string()?;
        let kind = VariableType::from_i32(self.read_i32()?).ok_or(ProtocolError::Truncated)?;
        let extended_type = self.read_string()?;
        let value = self.read_string()?;
        Ok(VariableInfo {
            name,
            kind,
            extended_type,
            value,
        })
    }
}

pub fn write_frame<W: Write>(w: &mut W, message: &Message) -> ProtocolResult<()> {
    if message.body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversize(message.body.len()));
    }
    let mut header = [0u8; 8];
    {
        let mut cursor = Cursor::new(&mut header[..]);
        cursor.write_u32::<LittleEndian>(message.body.len() as u32)?;
        cursor.write_u32::<LittleEndian>(message.tag)?;
    }
    w.write_all(&header)?;
    w.write_all(&message.body)?;
    w.flush()?;
    Ok(())
}

/// Blocks until a whole frame arrives. A stream that closes mid-frame is
/// reported as `Io`.
pub fn read_frame<R: Read>(r: &mut R) -> ProtocolResult<Message> {
    let size = r.read_u32::<LittleEndian>()? as usize;
    let tag = r.read_u32::<LittleEndian>()?;
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversize(size));
    }
    let mut body = vec![0u8; size];
    r.read_exact(&mut body)?;
    Ok(Message { tag, body })
}
