//! Firmware flashing through the bootloader.
//!
//! The bootloader is told the image size with `M650 A<size>` and then
//! receives the image as small chunks, echoing each one back. Flashing
//! cannot resume, so the first echo that differs from what was sent ends
//! the transfer. The version string kept in bootloader NVRAM is blanked
//! before flashing and written afterwards, so an interrupted flash is
//! visible as version `0.0.0`.

use {
    super::{ProgressCell, TransferProgress, TransferSummary},
    crate::{
        channel::CommandChannel,
        error::{Error, Result},
    },
    log::{debug, info},
    std::{fs, path::Path, time::Instant},
};

/// Version written when the caller does not supply one.
pub const DEFAULT_FIRMWARE_VERSION: &str = "20.0.0";

/// Version marker held while the image is being replaced.
const BLANK_VERSION: &str = "0.0.0";

/// Flash the image at `path`.
pub fn flash_file(
    channel: &mut CommandChannel,
    path: &Path,
    version: &str,
    progress: &ProgressCell,
) -> Result<TransferSummary> {
    let image = fs::read(path)?;
    flash_image(channel, &image, version, progress)
}

/// Flash `image` and record `version`.
pub fn flash_image(
    channel: &mut CommandChannel,
    image: &[u8],
    version: &str,
    progress: &ProgressCell,
) -> Result<TransferSummary> {
    let total = image.len() as u64;
    let mut state = TransferProgress {
        total_bytes: total,
        ..Default::default()
    };
    progress.publish(state);

    set_version(channel, BLANK_VERSION)?;

    info!("Flashing {total} bytes of firmware");
    let started = Instant::now();
    let reply = wait_ok(channel, &format!("M650 A{total}"));
    if !reply.contains("ok") {
        return Err(Error::Protocol(format!(
            "bootloader did not accept image size: {:?}",
            reply.trim()
        )));
    }

    let chunk_size = channel.profile().firmware_chunk_size;
    for chunk in image.chunks(chunk_size) {
        let offset = state.bytes_transferred;
        let written = channel.write(chunk);
        if written != chunk.len() {
            return Err(Error::TransferAborted {
                transferred: offset,
                total,
                errors_resolved: 0,
            });
        }

        let echo = read_echo(channel, chunk.len());
        if echo != chunk {
            debug!("Echo at {offset}: sent {chunk:02X?}, got {echo:02X?}");
            return Err(Error::EchoMismatch { offset });
        }

        state.bytes_transferred += chunk.len() as u64;
        progress.publish(state);
    }

    let elapsed = started.elapsed();
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        info!(
            "Flashed in {secs:.1} s ({:.1} KB/s)",
            total as f64 / 1000.0 / secs
        );
    }

    set_version(channel, version)?;
    Ok(TransferSummary {
        progress: state,
        cancelled: false,
        elapsed,
    })
}

/// Write the firmware version string (`M114 A<version>`).
pub fn set_version(channel: &mut CommandChannel, version: &str) -> Result<()> {
    let reply = wait_ok(channel, &format!("M114 A{version}"));
    if reply.contains("ok") {
        debug!("Firmware version set to {version}");
        Ok(())
    } else {
        Err(Error::Protocol(format!("version {version} was not stored")))
    }
}

fn wait_ok(channel: &mut CommandChannel, line: &str) -> String {
    let profile = channel.profile();
    let timeout = profile.read_timeout * profile.ack_reads;
    channel.wait_for(line, "ok", Some(timeout))
}

/// Collect the echo of a `len`-byte chunk.
fn read_echo(channel: &mut CommandChannel, len: usize) -> Vec<u8> {
    let timeout = channel.profile().echo_read_timeout;
    let mut echo = Vec::with_capacity(len);
    for _ in 0..channel.profile().echo_reads {
        echo.extend(channel.read_bytes(timeout, len - echo.len()));
        if echo.len() >= len {
            break;
        }
    }
    echo
}
