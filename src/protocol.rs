//! ChiTu M-code wire grammar
//!
//! Everything board-firmware-specific lives here: command encoding, chunk
//! framing, and reply parsing. The reconciliation logic never touches raw
//! bytes, so a different board family only needs a different codec module.
//!
//! The dialect is the one mainstream MSLA mainboards speak on port 3000:
//! newline-terminated ASCII commands with newline-terminated ASCII replies,
//! plus a binary frame format for file-write chunks.

/// Control port the board listens on.
pub const DEFAULT_PORT: u16 = 3000;

/// Fixed chunk payload size for file writes. Set by firmware convention,
/// not negotiable: larger writes overrun the board's receive buffer.
pub const CHUNK_SIZE: usize = 1280;

/// Trailer byte closing every chunk frame.
const CHUNK_TERMINATOR: u8 = 0x83;

/// Extensions the board recognizes as print jobs. Everything else in the
/// sync folder is ignored.
pub const PRINT_EXTENSIONS: &[&str] = &[".ctb", ".goo"];

/// Sentinel lines bracketing an `M20` directory listing.
pub const FILE_LIST_BEGIN: &str = "Begin file list";
pub const FILE_LIST_END: &str = "End file list";

// Centralized timeout constants; exceeding any of these is treated the same
// as a socket error and tears the session down.
pub mod timeouts {
    /// TCP connect deadline (ms)
    pub const CONNECT_MS: u64 = 2_000;

    /// Reply deadline for a single command exchange (ms)
    pub const COMMAND_MS: u64 = 3_000;

    /// Ack deadline per file-write chunk (ms)
    pub const CHUNK_ACK_MS: u64 = 3_000;
}

/// One control command. `encode` produces the exact line the firmware
/// expects; the variants map one-to-one onto the M-code set the board
/// implements for file and print management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `M99999`: identity query, doubles as the liveness ping.
    Handshake,
    /// `M20`: list files on onboard storage.
    ListFiles,
    /// `M28 <name>`: open a file for writing. Implicitly replaces an
    /// existing file of the same name.
    BeginWrite(String),
    /// `M4012 I1 T<total>`: ask the board to verify the byte count it
    /// received for the file currently open for writing.
    VerifySize(u64),
    /// `M29`: close the file opened by `BeginWrite`.
    EndWrite,
    /// `M30 <name>`: delete a file from onboard storage.
    Delete(String),
    /// `M6030 '<name>'`: start printing a stored file.
    StartPrint(String),
    /// `M33`: stop the running print.
    StopPrint,
    /// `M27`: query print progress.
    QueryStatus,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Command::Handshake => "M99999".to_string(),
            Command::ListFiles => "M20".to_string(),
            Command::BeginWrite(name) => format!("M28 {name}"),
            Command::VerifySize(total) => format!("M4012 I1 T{total}"),
            Command::EndWrite => "M29".to_string(),
            Command::Delete(name) => format!("M30 {name}"),
            Command::StartPrint(name) => format!("M6030 '{name}'"),
            Command::StopPrint => "M33".to_string(),
            Command::QueryStatus => "M27".to_string(),
        }
    }

    /// Some commands are answered with a payload line followed by a bare
    /// `ok` confirmation; the confirmation must be drained or it corrupts
    /// the next exchange.
    pub fn has_trailing_ok(&self) -> bool {
        matches!(
            self,
            Command::Delete(_) | Command::QueryStatus | Command::EndWrite
        )
    }
}

/// Frame one chunk of file data for transmission.
///
/// Layout: payload bytes | absolute offset (u32 LE) | XOR of payload+offset |
/// `0x83`. The board checks the XOR against what it received and the offset
/// against its write position, and answers `ok` or `resend`.
pub fn encode_chunk(offset: u32, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= CHUNK_SIZE);
    let mut frame = Vec::with_capacity(data.len() + 6);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&offset.to_le_bytes());
    let mut xor = 0u8;
    for &b in frame.iter() {
        xor ^= b;
    }
    frame.push(xor);
    frame.push(CHUNK_TERMINATOR);
    frame
}

/// Validate a received chunk frame and strip the trailer.
/// Returns (offset, payload) on success. Used by tests and by anything
/// emulating the board side of the protocol.
pub fn decode_chunk(frame: &[u8]) -> Option<(u32, &[u8])> {
    if frame.len() < 6 || frame[frame.len() - 1] != CHUNK_TERMINATOR {
        return None;
    }
    let body = &frame[..frame.len() - 2];
    let mut xor = 0u8;
    for &b in body {
        xor ^= b;
    }
    if xor != frame[frame.len() - 2] {
        return None;
    }
    let (payload, offs) = body.split_at(body.len() - 4);
    let offset = u32::from_le_bytes([offs[0], offs[1], offs[2], offs[3]]);
    Some((offset, payload))
}

/// Board's answer to one chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    Ok,
    /// Checksum or offset failure; the board names the offset it expected.
    /// Example: `resend 1280,offset error:6165760`
    Resend { offset: Option<u64> },
    /// Anything else. The firmware occasionally emits stray chatter.
    Unknown(String),
}

pub fn parse_chunk_ack(line: &str) -> ChunkAck {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("ok") => ChunkAck::Ok,
        Some("resend") => {
            let offset = line
                .rsplit("error:")
                .next()
                .and_then(|s| s.trim().parse::<u64>().ok());
            ChunkAck::Resend { offset }
        }
        _ => ChunkAck::Unknown(line.to_string()),
    }
}

/// Identity reported by the `M99999` handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterInfo {
    pub mac: String,
    pub ip: String,
    pub version: String,
    pub id: String,
    pub name: String,
}

/// Parse the handshake reply, e.g.
/// `ok MAC:00:e0:4c:27:00:2e IP:192.168.1.174 VER:V1.4.1 ID:2e,00,27,00 NAME:CBD`
pub fn parse_handshake(line: &str) -> Option<PrinterInfo> {
    let mut words = line.split_whitespace();
    if words.next() != Some("ok") {
        return None;
    }
    let mut info = PrinterInfo {
        mac: String::new(),
        ip: String::new(),
        version: String::new(),
        id: String::new(),
        name: String::new(),
    };
    for word in words {
        match word.split_once(':') {
            Some(("MAC", v)) => info.mac = v.to_string(),
            Some(("IP", v)) => info.ip = v.to_string(),
            Some(("VER", v)) => info.version = v.to_string(),
            Some(("ID", v)) => info.id = v.to_string(),
            // Firmware appends junk after a backslash in the name field
            Some(("NAME", v)) => {
                info.name = v.split('\\').next().unwrap_or(v).to_string()
            }
            _ => {}
        }
    }
    if info.version.is_empty() {
        return None;
    }
    Some(info)
}

/// Parse one line of an `M20` listing into (name, size).
///
/// Filenames may contain spaces, so the split point is the last recognized
/// print-job extension rather than whitespace. Zero-size entries are
/// placeholders the firmware leaves behind for deleted files and are
/// dropped here.
pub fn parse_list_entry(line: &str) -> Option<(String, u64)> {
    let lower = line.to_ascii_lowercase();
    let (idx, ext_len) = PRINT_EXTENSIONS
        .iter()
        .filter_map(|ext| lower.rfind(ext).map(|i| (i, ext.len())))
        .max_by_key(|&(i, _)| i)?;
    let split = idx + ext_len;
    let name = line[..split].to_string();
    let size: u64 = line[split..].trim().parse().ok()?;
    if size == 0 {
        return None;
    }
    Some((name, size))
}

/// Board's answer to an `M27` status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReply {
    Printing { bytes_read: u64, total_bytes: u64 },
    Paused { bytes_read: u64, total_bytes: u64 },
    Idle,
}

/// Parse an `M27` reply. While printing the board answers
/// `SD printing byte <done>/<total>`; any non-SD reply means idle.
/// Returns `None` only for an SD reply whose byte counters are garbled.
pub fn parse_status_reply(line: &str) -> Option<StatusReply> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.first() != Some(&"SD") {
        return Some(StatusReply::Idle);
    }
    let counters = words.get(3)?;
    let (done, total) = counters.split_once('/')?;
    let bytes_read = done.parse::<u64>().ok()?;
    let total_bytes = total.parse::<u64>().ok()?;
    if words.get(1) == Some(&"paused") {
        return Some(StatusReply::Paused {
            bytes_read,
            total_bytes,
        });
    }
    Some(StatusReply::Printing {
        bytes_read,
        total_bytes,
    })
}

/// The firmware signals command failure in prose, not with a status code.
pub fn is_error_reply(line: &str) -> bool {
    line.contains("Error") || line.contains("Failed")
}

/// Whether a filename carries one of the board's print-job extensions.
pub fn is_print_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PRINT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
