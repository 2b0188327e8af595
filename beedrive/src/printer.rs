//! Printer controller.
//!
//! [`Printer`] is the entry point for host code. It owns the command
//! channel, the sticky session flags and the transfer orchestrator, and it
//! refuses every ordinary command with [`Error::Busy`] while a transfer
//! holds the channel.

use {
    crate::{
        channel::{CommandChannel, Reply},
        device::PrinterIdentity,
        error::{Error, Result},
        mode::{PrinterMode, RunStatus, STATUS_PROBE, SessionFlags},
        orchestrator::{TransferOrchestrator, TransferReport},
        port::BulkPort,
        profile::ProtocolProfile,
        reply::{PrintVariables, ReplyFields},
        transfer::{TransferJob, TransferKind, TransferProgress, firmware, sd},
        transport::Transport,
    },
    log::{debug, info, warn},
    std::{
        path::Path,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        thread,
        time::{Duration, Instant},
    },
};

/// A connected printer.
pub struct Printer {
    channel: Arc<Mutex<CommandChannel>>,
    orchestrator: TransferOrchestrator,
    identity: PrinterIdentity,
    profile: ProtocolProfile,
    flags: SessionFlags,
    mode: PrinterMode,
}

impl Printer {
    /// Take over an opened port and bring the reply stream in step.
    pub fn new(port: Box<dyn BulkPort>, profile: ProtocolProfile) -> Result<Self> {
        profile.validate()?;
        let identity = port.identity().clone();
        let channel = Arc::new(Mutex::new(CommandChannel::new(
            Transport::new(port),
            profile.clone(),
        )));

        let mut printer = Self {
            orchestrator: TransferOrchestrator::new(Arc::clone(&channel)),
            channel,
            identity,
            profile,
            flags: SessionFlags::default(),
            mode: PrinterMode::Unknown,
        };
        let mode = printer.resync()?;
        info!("Connected to {} in {mode} mode", printer.identity.label());
        Ok(printer)
    }

    /// Open `identity` over USB.
    #[cfg(feature = "native")]
    pub fn open(identity: &PrinterIdentity, profile: ProtocolProfile) -> Result<Self> {
        let port = crate::port::UsbPort::open(identity)?;
        Self::new(Box::new(port), profile)
    }

    /// Find a printer (by serial number, or the first one attached) and
    /// open it with the default profile.
    #[cfg(feature = "native")]
    pub fn connect(serial: Option<&str>) -> Result<Self> {
        let identity = crate::device::find_printer(serial)?;
        Self::open(&identity, ProtocolProfile::default())
    }

    /// Identity of the connected unit.
    pub fn identity(&self) -> &PrinterIdentity {
        &self.identity
    }

    /// Parameters in effect.
    pub fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    /// Mode seen by the most recent probe.
    pub fn last_mode(&self) -> PrinterMode {
        self.mode
    }

    /// Sticky pause/shutdown flags.
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Lock the channel for an ordinary command.
    fn channel(&self) -> Result<MutexGuard<'_, CommandChannel>> {
        if self.orchestrator.is_active() {
            debug!("Command refused, transfer in progress");
            return Err(Error::Busy);
        }
        Ok(self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }

    /// Probe the mode with `M625`.
    pub fn printer_mode(&mut self) -> Result<PrinterMode> {
        let reply = self.channel()?.dispatch(STATUS_PROBE);
        self.mode = PrinterMode::from_reply(&reply);
        debug!("Mode probe: {}", self.mode);
        Ok(self.mode)
    }

    /// Probe the mode, cleaning the buffer and probing once more if the
    /// reply was not recognised.
    pub fn resync(&mut self) -> Result<PrinterMode> {
        let mode = self.printer_mode()?;
        if mode != PrinterMode::Unknown {
            return Ok(mode);
        }
        warn!("Unrecognised mode reply, cleaning command buffer");
        self.clean_buffer()?;
        self.printer_mode()
    }

    /// Flush a desynchronized reply stream. Returns the tries left.
    pub fn clean_buffer(&mut self) -> Result<usize> {
        match self.channel()?.clean_buffer() {
            0 => Err(Error::Desync),
            tries => Ok(tries),
        }
    }

    /// Reboot into `target`.
    ///
    /// Returns `false` without touching the device when the printer is
    /// already there. The mode is only trusted again after the device has
    /// re-enumerated and been re-probed.
    pub fn switch_mode(&mut self, target: PrinterMode) -> Result<bool> {
        let Some(command) = target.switch_command() else {
            return Err(Error::Config("cannot switch to an unknown mode".to_string()));
        };
        let current = self.resync()?;
        if current == target {
            debug!("Already in {target} mode");
            return Ok(false);
        }

        info!("Switching from {current} to {target} mode");
        let reconnected = {
            let mut channel = self.channel()?;
            channel.dispatch(command);
            channel.reconnect()
        };
        if let Err(e) = reconnected {
            warn!("Printer did not come back after {command}: {e}");
            self.mode = PrinterMode::Unknown;
            return Err(Error::ModeSwitch {
                target,
                observed: PrinterMode::Unknown,
            });
        }

        let observed = self.resync()?;
        if observed != target {
            return Err(Error::ModeSwitch { target, observed });
        }
        self.flags = SessionFlags::default();
        Ok(true)
    }

    /// Reboot into the main firmware.
    pub fn go_to_firmware(&mut self) -> Result<bool> {
        self.switch_mode(PrinterMode::Firmware)
    }

    /// Reboot into the bootloader.
    pub fn go_to_bootloader(&mut self) -> Result<bool> {
        self.switch_mode(PrinterMode::Bootloader)
    }

    /// Poll the run status until the firmware reports one or `timeout`
    /// passes. Updates the sticky flags.
    pub fn status(&mut self, timeout: Duration) -> Result<RunStatus> {
        let deadline = Instant::now() + timeout;
        let interval = self.profile.timing.status_poll_interval;
        loop {
            let reply = self.channel()?.dispatch(STATUS_PROBE);
            match PrinterMode::from_reply(&reply) {
                PrinterMode::Bootloader => {
                    self.mode = PrinterMode::Bootloader;
                    return Err(Error::WrongMode {
                        expected: PrinterMode::Firmware,
                        actual: PrinterMode::Bootloader,
                    });
                },
                PrinterMode::Firmware => self.mode = PrinterMode::Firmware,
                PrinterMode::Unknown => {},
            }

            if reply.to_lowercase().contains("s:") {
                let status = RunStatus::decode(&reply, &self.profile.status_codes).ok_or_else(
                    || Error::Protocol(format!("unknown status in {:?}", reply.trim())),
                )?;
                self.flags.observe(status);
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("no status within {timeout:?}")));
            }
            thread::sleep(interval);
        }
    }

    /// Send a raw command line.
    pub fn send_command(&mut self, line: &str, reply: &Reply) -> Result<String> {
        self.channel()?.send_command(line, reply)
    }

    /// Current nozzle temperature in degrees Celsius (`M105`).
    pub fn nozzle_temperature(&mut self) -> Result<f64> {
        let reply = self.channel()?.dispatch("M105");
        ReplyFields::parse(&reply)
            .float('T')
            .ok_or_else(|| Error::Protocol(format!("no temperature in {:?}", reply.trim())))
    }

    /// Counters of the print in progress (`M32`).
    pub fn print_variables(&mut self) -> Result<PrintVariables> {
        let reply = self.channel()?.dispatch("M32");
        Ok(PrintVariables::from_reply(&reply))
    }

    /// Firmware version string (`M115`).
    pub fn firmware_version(&mut self) -> Result<String> {
        let reply = self.channel()?.dispatch("M115");
        reply
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with("ok"))
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("empty version reply".to_string()))
    }

    /// Store a firmware version string in the bootloader (`M114 A<version>`).
    pub fn set_firmware_string(&mut self, version: &str) -> Result<()> {
        let mut channel = self.channel()?;
        firmware::set_version(&mut channel, version)
    }

    /// Heat the nozzle to `temperature` and wait until the firmware is idle
    /// again.
    pub fn start_heating(&mut self, temperature: f64, timeout: Duration) -> Result<()> {
        let code = self.ready_code()?;
        self.channel()?
            .wait_for_status(&format!("M703 S{temperature:.2}"), code, timeout)?;
        info!("Nozzle at {temperature:.1} C");
        Ok(())
    }

    /// Pause the SD print (`M640`). The pause lands asynchronously.
    pub fn pause(&mut self) -> Result<()> {
        self.channel()?.dispatch("M640");
        self.flags.pausing = true;
        Ok(())
    }

    /// Resume a paused or shut down print (`M643`).
    pub fn resume(&mut self) -> Result<()> {
        self.channel()?.dispatch("M643");
        self.flags.resume();
        Ok(())
    }

    /// Leave the shutdown state without resuming (`M505`).
    pub fn clear_shutdown(&mut self) -> Result<()> {
        self.channel()?.dispatch("M505");
        self.flags.clear_shutdown();
        Ok(())
    }

    /// Pause the print and then shut down (`M36`).
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        if !self.flags.paused {
            let code = self.status_code(RunStatus::Pause)?;
            self.flags.pausing = true;
            self.channel()?
                .wait_for_status("M640", code, timeout)?;
            self.flags.observe(RunStatus::Pause);
        }
        self.channel()?.dispatch("M36");
        self.flags.observe(RunStatus::Shutdown);
        info!("Printer shut down");
        Ok(())
    }

    /// Stop what the printer is doing: cancels the active transfer, or
    /// sends an emergency stop (`M112`) when there is none.
    pub fn cancel_print(&mut self) -> Result<()> {
        if self.orchestrator.cancel() {
            return Ok(());
        }
        self.channel()?.dispatch("M112");
        self.flags = SessionFlags::default();
        Ok(())
    }

    /// User files on the SD card.
    pub fn sd_files(&mut self) -> Result<Vec<String>> {
        let mut channel = self.channel()?;
        sd::list_files(&mut channel)
    }

    /// Start printing a file already on the SD card.
    pub fn start_sd_print(&mut self, name: &str) -> Result<()> {
        let mut channel = self.channel()?;
        sd::open_file(&mut channel, name)?;
        sd::start_print(&mut channel, name)
    }

    /// Copy a G-code file to the SD card in the background.
    pub fn transfer_gcode(&mut self, path: &Path, name: Option<&str>) -> Result<()> {
        self.start_job(job(path, TransferKind::Gcode, name), PrinterMode::Firmware)
    }

    /// Flash a firmware image in the background.
    pub fn flash_firmware(&mut self, path: &Path, version: Option<&str>) -> Result<()> {
        self.start_job(job(path, TransferKind::Firmware, version), PrinterMode::Bootloader)
    }

    /// Copy a G-code file to the SD card and print it.
    ///
    /// With a `temperature` the nozzle starts heating before the copy so
    /// both run at the same time.
    pub fn print_file(
        &mut self,
        path: &Path,
        name: Option<&str>,
        temperature: Option<f64>,
    ) -> Result<()> {
        let job = job(path, TransferKind::Print, name);
        if self.orchestrator.is_active() {
            return Err(Error::Busy);
        }
        self.switch_mode(PrinterMode::Firmware)?;
        if let Some(temperature) = temperature {
            self.channel()?
                .dispatch(&format!("M703 S{temperature:.2}"));
        }
        self.start_job(job, PrinterMode::Firmware)
    }

    fn start_job(&mut self, job: TransferJob, mode: PrinterMode) -> Result<()> {
        if self.orchestrator.is_active() {
            return Err(Error::Busy);
        }
        self.switch_mode(mode)?;
        if self.orchestrator.start(job) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// Percentage of the active transfer confirmed, `None` when idle.
    pub fn transfer_progress(&self) -> Option<f64> {
        self.orchestrator.completion_percent()
    }

    /// Latest progress counters.
    pub fn transfer_snapshot(&self) -> TransferProgress {
        self.orchestrator.progress()
    }

    /// Ask the active transfer to stop at the next block.
    pub fn cancel_transfer(&self) -> bool {
        self.orchestrator.cancel()
    }

    /// Whether a transfer holds the channel.
    pub fn is_transferring(&self) -> bool {
        self.orchestrator.is_active()
    }

    /// Block until the transfer ends.
    pub fn wait_transfer(&mut self) -> Option<TransferReport> {
        self.orchestrator.wait()
    }

    /// Stop any transfer and release the device.
    pub fn close(&mut self) {
        if self.orchestrator.cancel() {
            let _ = self.orchestrator.wait();
        }
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
    }

    fn status_code(&self, status: RunStatus) -> Result<u32> {
        self.profile
            .status_codes
            .code(status)
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| Error::Config(format!("no status code for {status}")))
    }

    fn ready_code(&self) -> Result<u32> {
        self.status_code(RunStatus::Ready)
    }
}

fn job(path: &Path, kind: TransferKind, destination: Option<&str>) -> TransferJob {
    let job = TransferJob::new(path, kind);
    match destination {
        Some(d) => job.with_destination(d),
        None => job,
    }
}
