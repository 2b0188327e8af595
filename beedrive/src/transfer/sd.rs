//! SD card handshakes.

use log::{debug, info, warn};

use crate::channel::CommandChannel;
use crate::error::{Error, Result};

/// File name used when a job does not name its destination.
pub const DEFAULT_SD_NAME: &str = "ABCDE";

/// Longest name the firmware's 8.3 file system accepts.
const MAX_NAME_LEN: usize = 8;

/// Listing entries that belong to the printer itself.
const SYSTEM_FILES: &[&str] = &["firmware.bck", "firmware.bin", "config.txt", "config.bck"];

/// Reads allowed while the file listing streams in.
const LIST_READS: u32 = 100;

/// Turn an arbitrary name into an 8.3-compatible SD file name.
///
/// Non-alphanumerics are dropped, names longer than eight characters are
/// cut to seven, and a leading digit becomes `a`.
pub fn sanitize_sd_name(name: &str) -> String {
    let mut clean: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if clean.is_empty() {
        return DEFAULT_SD_NAME.to_string();
    }
    if clean.len() > MAX_NAME_LEN {
        clean.truncate(MAX_NAME_LEN - 1);
    }
    if clean.starts_with(|c: char| c.is_ascii_digit()) {
        clean.replace_range(..1, "a");
    }
    clean
}

/// Mount the SD card (`M21`).
pub fn init_sd(channel: &mut CommandChannel) -> Result<()> {
    channel.write(b"M21\n");
    let mut reply = String::new();
    for _ in 0..channel.profile().sd_tries {
        reply.push_str(&channel.read());
        if reply.contains("ok") {
            debug!("SD card initialised");
            return Ok(());
        }
    }
    Err(Error::Sd("card did not acknowledge M21".to_string()))
}

/// Create (or truncate) `name` on the SD card (`M30`).
pub fn create_file(channel: &mut CommandChannel, name: &str) -> Result<()> {
    init_sd(channel)?;
    let name: String = name
        .chars()
        .take(MAX_NAME_LEN)
        .collect();
    let reply = channel.dispatch(&format!("M30 {name}"));
    await_marker(channel, reply, "file created")
        .map_err(|e| Error::Sd(format!("creating {name}: {e}")))?;
    info!("Created SD file {name}");
    Ok(())
}

/// Select `name` for playback (`M23`).
pub fn open_file(channel: &mut CommandChannel, name: &str) -> Result<()> {
    init_sd(channel)?;
    let reply = channel.dispatch(&format!("M23 {name}"));
    await_marker(channel, reply, "file opened")
        .map_err(|e| Error::Sd(format!("opening {name}: {e}")))?;
    debug!("Opened SD file {name}");
    Ok(())
}

/// Start printing the selected SD file (`M33`).
pub fn start_print(channel: &mut CommandChannel, name: &str) -> Result<()> {
    let reply = channel.dispatch(&format!("M33 {name}"));
    if reply
        .to_lowercase()
        .contains("error")
    {
        return Err(Error::Sd(format!("printer refused to print {name}")));
    }
    info!("Started SD print of {name}");
    Ok(())
}

/// Names of the user files on the SD card (`M20`).
pub fn list_files(channel: &mut CommandChannel) -> Result<Vec<String>> {
    init_sd(channel)?;
    channel.write(b"M20\n");

    let mut reply = String::new();
    let mut reads = 0;
    while !reply
        .to_lowercase()
        .contains("end file list")
    {
        if reads == LIST_READS {
            return Err(Error::Timeout("SD file listing did not finish".to_string()));
        }
        reply.push_str(&channel.read());
        reads += 1;
    }

    Ok(parse_listing(&reply))
}

fn parse_listing(reply: &str) -> Vec<String> {
    reply
        .lines()
        .take_while(|l| !l.to_lowercase().contains("end file list"))
        .filter(|l| l.contains('/'))
        .filter(|l| {
            let lower = l.to_lowercase();
            !SYSTEM_FILES
                .iter()
                .any(|f| lower.contains(f))
        })
        .map(|l| {
            l.trim_end_matches('\r')
                .trim_start_matches('/')
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Poll with bare newlines until `marker` shows up, failing fast on `error`.
fn await_marker(channel: &mut CommandChannel, mut reply: String, marker: &str) -> Result<()> {
    for _ in 0..channel.profile().sd_tries {
        let lower = reply.to_lowercase();
        if lower.contains(marker) {
            return Ok(());
        }
        if lower.contains("error") {
            return Err(Error::Protocol(reply.trim().to_string()));
        }
        reply = channel.dispatch("");
    }
    warn!("Gave up waiting for {marker:?}");
    Err(Error::Timeout(format!("no {marker:?} reply")))
}
