//! Block transfer engine.
//!
//! A file is sent as a sequence of blocks. Each block is announced with
//! `M28 D<last byte> A<first byte>`, then written as fixed-size messages
//! that the firmware acknowledges one by one. A message whose
//! acknowledgment never arrives is recovered by cleaning the command buffer
//! and reconnecting; only that message is sent again.

use {
    super::{CancelToken, ProgressCell, TransferProgress, TransferSummary},
    crate::{
        channel::CommandChannel,
        error::{Error, Result},
    },
    log::{debug, error, info, warn},
    std::{
        io::Read,
        ops::Range,
        thread,
        time::{Duration, Instant},
    },
};

/// Result of sending one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Acknowledged.
    Sent,
    /// Lost, but the link was resynchronized: send the same message again.
    Retry,
    /// The link could not be resynchronized.
    Fatal,
}

/// Block layout of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    /// File size in bytes.
    pub file_size: u64,
    /// Bytes per block.
    pub block_bytes: u64,
}

impl BlockPlan {
    /// Plan a file of `file_size` bytes.
    pub fn new(file_size: u64, block_bytes: usize) -> Self {
        Self {
            file_size,
            block_bytes: block_bytes as u64,
        }
    }

    /// Number of blocks, rounding the last partial block up.
    pub fn total_blocks(&self) -> u64 {
        self.file_size
            .div_ceil(self.block_bytes)
    }

    /// Byte range of block `index`.
    pub fn block_range(&self, index: u64) -> Range<u64> {
        let start = index * self.block_bytes;
        let end = (start + self.block_bytes).min(self.file_size);
        start..end
    }
}

/// Sends one file through the block protocol.
pub struct BlockTransfer<'a> {
    channel: &'a mut CommandChannel,
    progress: &'a ProgressCell,
    cancel: &'a CancelToken,
    errors_resolved: u32,
}

impl<'a> BlockTransfer<'a> {
    /// Bind an engine to a channel.
    pub fn new(
        channel: &'a mut CommandChannel,
        progress: &'a ProgressCell,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            channel,
            progress,
            cancel,
            errors_resolved: 0,
        }
    }

    /// Stream `total` bytes from `source`.
    ///
    /// The cancel flag is checked before every block; a cancelled run keeps
    /// the blocks already written and reports `cancelled`.
    pub fn send<R: Read>(&mut self, mut source: R, total: u64) -> Result<TransferSummary> {
        let plan = BlockPlan::new(total, self.channel.profile().block_bytes());
        let total_blocks = plan.total_blocks();
        let started = Instant::now();
        let mut progress = TransferProgress {
            total_bytes: total,
            total_blocks,
            ..Default::default()
        };
        self.progress.publish(progress);
        info!("Sending {total} bytes in {total_blocks} blocks");

        for index in 0..total_blocks {
            if self.cancel.is_cancelled() {
                info!("Transfer cancelled before block {}/{total_blocks}", index + 1);
                return Ok(TransferSummary {
                    progress,
                    cancelled: true,
                    elapsed: started.elapsed(),
                });
            }

            let range = plan.block_range(index);
            let mut data = vec![0u8; usize::try_from(range.end - range.start).unwrap_or(0)];
            source.read_exact(&mut data)?;

            if let Err(e) = self.send_block(&range, &data) {
                error!(
                    "Transfer failed: {} of {total} bytes, {} errors resolved",
                    progress.bytes_transferred, self.errors_resolved
                );
                return Err(match e {
                    Error::Desync => Error::TransferAborted {
                        transferred: progress.bytes_transferred,
                        total,
                        errors_resolved: self.errors_resolved,
                    },
                    other => other,
                });
            }

            progress.bytes_transferred += data.len() as u64;
            progress.blocks_done = index + 1;
            progress.errors_resolved = self.errors_resolved;
            self.progress.publish(progress);
            debug!(
                "Block {}/{total_blocks} done ({} of {total} bytes)",
                index + 1,
                progress.bytes_transferred
            );
        }

        let elapsed = started.elapsed();
        log_rate(total, elapsed, self.errors_resolved);
        Ok(TransferSummary {
            progress,
            cancelled: false,
            elapsed,
        })
    }

    /// Open the block and send its messages.
    ///
    /// Fails with [`Error::Desync`] when recovery is exhausted.
    fn send_block(&mut self, range: &Range<u64>, data: &[u8]) -> Result<()> {
        let resends = self.channel.profile().message_resends;

        let mut attempts = 0;
        while !self.open_block(range) {
            attempts += 1;
            if attempts > resends || self.recover() == MessageOutcome::Fatal {
                return Err(Error::Desync);
            }
        }

        let message_size = self.channel.profile().message_size;
        for (i, message) in data.chunks(message_size).enumerate() {
            let mut attempts = 0;
            loop {
                match self.send_message(message) {
                    MessageOutcome::Sent => break,
                    MessageOutcome::Retry if attempts < resends => {
                        attempts += 1;
                        debug!("Resending message {i} of block at {}", range.start);
                    },
                    MessageOutcome::Retry | MessageOutcome::Fatal => return Err(Error::Desync),
                }
            }
        }
        Ok(())
    }

    /// Announce the byte range and wait for the firmware's queue to drain.
    fn open_block(&mut self, range: &Range<u64>) -> bool {
        let command = format!("M28 D{} A{}\n", range.end - 1, range.start);
        self.channel.write(command.as_bytes());

        let mut reply = String::new();
        for _ in 0..self.channel.profile().block_open_reads {
            reply.push_str(&self.channel.read().to_lowercase());
            if reply.contains("ok q:0") {
                return true;
            }
        }
        warn!("Block at {} was not acknowledged", range.start);
        false
    }

    /// Write one message and wait for its acknowledgment.
    pub fn send_message(&mut self, message: &[u8]) -> MessageOutcome {
        let written = self.channel.write(message);
        if written == message.len() {
            thread::sleep(self.channel.profile().timing.ack_delay);
            if self.await_ack() {
                return MessageOutcome::Sent;
            }
            warn!("Message of {} bytes was not acknowledged", message.len());
        } else {
            warn!("Bytes lost: wrote {written} of {}", message.len());
        }
        self.recover()
    }

    fn await_ack(&mut self) -> bool {
        let mut reply = String::new();
        for _ in 0..self.channel.profile().ack_reads {
            reply.push_str(&self.channel.read());
            if reply.contains("tog") {
                return true;
            }
        }
        false
    }

    /// Clean the buffer and reconnect until the link is quiet again.
    fn recover(&mut self) -> MessageOutcome {
        let cycles = self.channel.profile().clean_cycles;
        let pause = self.channel.profile().timing.clean_pause;

        for cycle in 1..=cycles {
            let tries_left = self.channel.clean_buffer();
            thread::sleep(pause);
            if let Err(e) = self.channel.reconnect() {
                warn!("Reconnect after clean {cycle}/{cycles} failed: {e}");
                continue;
            }
            if tries_left > 0 {
                self.errors_resolved += 1;
                info!("Transmission error resolved ({} so far)", self.errors_resolved);
                return MessageOutcome::Retry;
            }
            warn!("Buffer still dirty after clean {cycle}/{cycles}");
        }

        error!("Could not resynchronize after {cycles} clean cycles");
        MessageOutcome::Fatal
    }
}

fn log_rate(total: u64, elapsed: Duration, errors: u32) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        total as f64 / 1000.0 / secs
    } else {
        0.0
    };
    info!("Transfer completed in {secs:.1} s ({rate:.1} KB/s), {errors} errors resolved");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProtocolProfile, Timing};
    use crate::testing::{FakePrinter, Written};
    use crate::transport::Transport;
    use std::io::Cursor;

    fn channel(fake: &FakePrinter, profile: ProtocolProfile) -> CommandChannel {
        CommandChannel::new(
            Transport::new(Box::new(fake.clone())),
            profile.with_timing(Timing::immediate()),
        )
    }

    fn small_profile() -> ProtocolProfile {
        // 4 messages of 16 bytes per block.
        ProtocolProfile::default().with_geometry(16, 4)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| b'a' + (i % 26) as u8)
            .collect()
    }

    /// Sets the cancel flag once `after` bytes have been read.
    struct CancelAfter {
        inner: Cursor<Vec<u8>>,
        cancel: CancelToken,
        after: u64,
    }

    impl Read for CancelAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inner.read(buf)?;
            if self.inner.position() >= self.after {
                self.cancel.cancel();
            }
            Ok(n)
        }
    }

    #[test]
    fn test_block_plan() {
        let plan = BlockPlan::new(100_000, 32_768);
        assert_eq!(plan.total_blocks(), 4);
        assert_eq!(plan.block_range(3), 98_304..100_000);

        assert_eq!(BlockPlan::new(32_768, 32_768).total_blocks(), 1);
        assert_eq!(BlockPlan::new(32_769, 32_768).total_blocks(), 2);
        assert_eq!(BlockPlan::new(0, 32_768).total_blocks(), 0);
    }

    #[test]
    fn test_send_file_in_blocks() {
        let fake = FakePrinter::firmware();
        let mut ch = channel(&fake, small_profile());
        let progress = ProgressCell::default();
        let cancel = CancelToken::default();
        let data = payload(150);

        let summary = BlockTransfer::new(&mut ch, &progress, &cancel)
            .send(Cursor::new(data.clone()), 150)
            .unwrap();

        assert!(!summary.cancelled);
        assert_eq!(summary.progress.bytes_transferred, 150);
        assert_eq!(summary.progress.total_blocks, 3);
        assert_eq!(progress.snapshot().bytes_transferred, 150);
        assert_eq!(fake.received(), data);
        assert_eq!(
            fake.commands(),
            vec!["M28 D63 A0", "M28 D127 A64", "M28 D149 A128"]
        );
        // Last block: one full message plus a 6-byte tail.
        let messages = fake.data_messages();
        assert_eq!(messages.len(), 4 + 4 + 2);
        assert_eq!(messages.last().map(Vec::len), Some(6));
    }

    #[test]
    fn test_default_geometry_block_count() {
        let fake = FakePrinter::firmware();
        let mut ch = channel(&fake, ProtocolProfile::default());
        let progress = ProgressCell::default();
        let cancel = CancelToken::default();
        let size = 2 * 32_768 + 100;

        let summary = BlockTransfer::new(&mut ch, &progress, &cancel)
            .send(Cursor::new(payload(size)), size as u64)
            .unwrap();

        assert_eq!(summary.progress.total_blocks, 3);
        assert_eq!(summary.progress.bytes_transferred, size as u64);
        assert_eq!(fake.data_messages().len(), 64 + 64 + 1);
    }

    #[test]
    fn test_lost_ack_resends_only_that_message() {
        let fake = FakePrinter::firmware();
        // Third message of the second block.
        fake.drop_ack(6);
        let mut ch = channel(&fake, small_profile());
        let progress = ProgressCell::default();
        let cancel = CancelToken::default();
        let data = payload(128);

        let mut engine = BlockTransfer::new(&mut ch, &progress, &cancel);
        let summary = engine
            .send(Cursor::new(data.clone()), 128)
            .unwrap();

        assert_eq!(summary.progress.errors_resolved, 1);
        assert_eq!(fake.reconnects(), 1);
        assert_eq!(fake.received(), data);

        let messages = fake.data_messages();
        assert_eq!(messages.len(), 9);
        assert_eq!(messages[6], messages[7]);
        assert_eq!(messages[6], data[96..112].to_vec());

        // One clean cycle sits between the lost message and its re-send,
        // and the block is not re-opened.
        let writes = fake.writes();
        let lost = writes
            .iter()
            .position(|w| *w == Written::Data(data[96..112].to_vec()))
            .unwrap();
        assert_eq!(writes[lost + 1], Written::Clean);
        assert_eq!(writes[lost + 2], Written::Clean);
        assert_eq!(writes[lost + 3], Written::Data(data[96..112].to_vec()));
        assert_eq!(
            fake.commands()
                .iter()
                .filter(|c| c.starts_with("M28"))
                .count(),
            2
        );
    }

    #[test]
    fn test_short_write_triggers_recovery() {
        let fake = FakePrinter::firmware();
        fake.short_write(0);
        let mut ch = channel(&fake, small_profile());
        let progress = ProgressCell::default();
        let cancel = CancelToken::default();

        let summary = BlockTransfer::new(&mut ch, &progress, &cancel)
            .send(Cursor::new(payload(64)), 64)
            .unwrap();
        assert_eq!(summary.progress.errors_resolved, 1);
        assert_eq!(fake.data_messages().len(), 5);
    }

    #[test]
    fn test_unrecoverable_desync_aborts() {
        let fake = FakePrinter::firmware();
        fake.drop_ack(1);
        fake.set_desync(true);
        let mut ch = channel(&fake, small_profile());
        let progress = ProgressCell::default();
        let cancel = CancelToken::default();

        let err = BlockTransfer::new(&mut ch, &progress, &cancel)
            .send(Cursor::new(payload(128)), 128)
            .unwrap_err();

        match err {
            Error::TransferAborted {
                transferred,
                total,
                errors_resolved,
            } => {
                assert_eq!(transferred, 0);
                assert_eq!(total, 128);
                assert_eq!(errors_resolved, 0);
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fake.reconnects(), 5);
    }

    #[test]
    fn test_cancel_between_blocks() {
        let fake = FakePrinter::firmware();
        let mut ch = channel(&fake, small_profile());
        let progress = ProgressCell::default();
        let cancel = CancelToken::default();
        let source = CancelAfter {
            inner: Cursor::new(payload(200)),
            cancel: cancel.clone(),
            after: 128,
        };

        let summary = BlockTransfer::new(&mut ch, &progress, &cancel)
            .send(source, 200)
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.progress.blocks_done, 2);
        assert_eq!(summary.progress.bytes_transferred, 128);
        assert_eq!(progress.snapshot().bytes_transferred, 128);
        assert_eq!(fake.received().len(), 128);
    }
}
