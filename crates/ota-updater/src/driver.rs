//! Update state machine.
//!
//! The [`Driver`] consumes an update package incrementally. Every state is a
//! separate handler that reports whether it needs more input, wants the loop
//! to continue, or has reached a terminal result:
//!
//! ```text
//! Init -> AwaitingManifestHeader -> AwaitingManifest -> SkippingDescriptor
//!                                                            |
//!        +---------------------------------------------------+
//!        v
//! AwaitingFileHeader --write--> AwaitingFile --+
//!        |  ^        --skip---> SkippingData --+--> SkippingDescriptor --+
//!        |  +---------------------------------------------------------+
//!        +--central directory--> WriteFinished --finalize--> Finalize --> Finished
//! ```
//!
//! All terminal outcomes go through a single idempotent finish path which
//! publishes one `done` event and runs the completion callback once.

use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::archive::{self, LocalHeader, DATA_DESCRIPTOR_LEN};
use crate::backend::{FileAction, FileInfo, FlashContext};
use crate::checksum::{self, RunningCrc};
use crate::commit::CommitTimeoutStore;
use crate::error::UpdateError;
use crate::events::{OtaState, StatusBus, UpdateSnapshot};
use crate::input::{InputBuffer, InputView};
use crate::manifest::{FirmwareInfo, Manifest, MANIFEST_FILENAME};
use crate::progress::ProgressTracker;

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Init,
    AwaitingManifestHeader,
    AwaitingManifest,
    AwaitingFileHeader,
    AwaitingFile,
    SkippingData,
    SkippingDescriptor,
    /// End of archive reached, waiting for finalize
    WriteFinished,
    Finalize,
    Finished,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::AwaitingManifestHeader => "awaiting manifest header",
            Self::AwaitingManifest => "awaiting manifest",
            Self::AwaitingFileHeader => "awaiting file header",
            Self::AwaitingFile => "awaiting file",
            Self::SkippingData => "skipping data",
            Self::SkippingDescriptor => "skipping descriptor",
            Self::WriteFinished => "write finished",
            Self::Finalize => "finalize",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Outcome of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Still running
    Pending,
    /// Update applied
    Success,
    /// Package carries the running firmware, nothing written
    UpToDate,
    Failure,
}

impl UpdateResult {
    /// Whether the session ended without error.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::UpToDate)
    }
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::UpToDate => "up to date",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Final report handed to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result: UpdateResult,
    pub status_message: String,
    pub needs_reboot: bool,
}

/// Invoked once when the session finishes.
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send + 'static>;

/// Settings of one update.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Identity of the running firmware
    pub firmware: FirmwareInfo,
    /// Stop successfully when the package carries the running firmware
    pub ignore_same_version: bool,
    /// Largest manifest accepted, in bytes
    pub max_manifest_size: u64,
    /// Total package size, when the transport knows it
    pub archive_size: Option<u64>,
    /// Where finalize persists the commit timeout
    pub commit_store: CommitTimeoutStore,
}

/// Options of the finalize request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// Seconds the new image has to commit after reboot; 0 commits at boot
    pub commit_timeout: u64,
}

/// What a state handler wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    NeedMore,
    Continue,
    Done,
}

/// Streaming update parser driving a flashing context.
pub struct Driver<C: FlashContext> {
    state: UpdateState,
    ctx: C,
    options: DriverOptions,
    events: StatusBus,

    entry: FileInfo,
    crc_declared: u32,
    crc: RunningCrc,
    has_descriptor: bool,

    manifest: Option<Manifest>,
    result: UpdateResult,
    status_message: Option<String>,
    needs_reboot: bool,
    progress: ProgressTracker,
    commit_timeout: u64,
    on_complete: Option<CompletionCallback>,
}

impl<C: FlashContext> Driver<C> {
    pub fn new(ctx: C, options: DriverOptions, events: StatusBus) -> Self {
        let progress = ProgressTracker::new(options.archive_size);
        Self {
            state: UpdateState::Init,
            ctx,
            options,
            events,
            entry: FileInfo::default(),
            crc_declared: 0,
            crc: RunningCrc::new(),
            has_descriptor: false,
            manifest: None,
            result: UpdateResult::Pending,
            status_message: None,
            needs_reboot: false,
            progress,
            commit_timeout: 0,
            on_complete: None,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn result(&self) -> UpdateResult {
        self.result
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn needs_reboot(&self) -> bool {
        self.needs_reboot
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Entry currently being processed.
    pub fn current_entry(&self) -> &FileInfo {
        &self.entry
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.progress.downloaded()
    }

    pub fn is_write_finished(&self) -> bool {
        self.state == UpdateState::WriteFinished
    }

    pub fn is_finished(&self) -> bool {
        self.state == UpdateState::Finished
    }

    /// Register the completion callback, replacing any previous one.
    pub fn set_on_complete(&mut self, callback: CompletionCallback) {
        self.on_complete = Some(callback);
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// Account for a chunk handed over by the transport.
    pub fn record_download(&mut self, bytes: usize) {
        self.progress.record_download(bytes);
    }

    /// Feed one transport chunk through the carry-over buffer.
    pub fn process_chunk(
        &mut self,
        buffer: &mut InputBuffer,
        chunk: &[u8],
    ) -> Result<UpdateResult, UpdateError> {
        self.record_download(chunk.len());
        let mut view = buffer.feed(chunk);
        self.process(&mut view)
    }

    /// Run the state machine over the available input.
    ///
    /// Returns `Pending` while more input (or a finalize request) is needed.
    /// Any error is terminal: the session is finished with a failure and the
    /// error is returned.
    pub fn process(&mut self, input: &mut InputView<'_>) -> Result<UpdateResult, UpdateError> {
        match self.run(input) {
            Ok(()) => {
                if self.result != UpdateResult::Pending {
                    self.finish();
                    input.discard_all();
                }
                Ok(self.result)
            }
            Err(e) => {
                self.result = UpdateResult::Failure;
                self.status_message = Some(e.to_string());
                self.finish();
                input.discard_all();
                Err(e)
            }
        }
    }

    /// Commit the staged writes once the whole package has been received.
    ///
    /// Rejected with [`UpdateError::NotReady`] unless the end of the archive
    /// has been reached; the session is left untouched in that case.
    pub fn request_finalize(
        &mut self,
        options: FinalizeOptions,
    ) -> Result<UpdateResult, UpdateError> {
        if self.state != UpdateState::WriteFinished {
            return Err(UpdateError::NotReady(format!("state is {}", self.state)));
        }
        self.commit_timeout = options.commit_timeout;
        self.set_state(UpdateState::Finalize);

        let mut buffer = InputBuffer::new();
        let mut view = buffer.feed(&[]);
        self.process(&mut view)
    }

    /// Terminate the session with a failure.
    ///
    /// A no-op once the session has finished.
    pub fn fail(&mut self, err: &UpdateError) {
        if self.state == UpdateState::Finished {
            return;
        }
        self.result = UpdateResult::Failure;
        self.status_message = Some(err.to_string());
        self.finish();
    }

    fn run(&mut self, input: &mut InputView<'_>) -> Result<(), UpdateError> {
        loop {
            let step = match self.state {
                UpdateState::Init => {
                    self.set_state(UpdateState::AwaitingManifestHeader);
                    Step::Continue
                }
                UpdateState::AwaitingManifestHeader => self.on_manifest_header(input)?,
                UpdateState::AwaitingManifest => self.on_manifest(input)?,
                UpdateState::AwaitingFileHeader => self.on_file_header(input)?,
                UpdateState::AwaitingFile => self.on_file_data(input)?,
                UpdateState::SkippingData => self.on_skip_data(input),
                UpdateState::SkippingDescriptor => self.on_skip_descriptor(),
                UpdateState::WriteFinished => {
                    // Central directory and anything after it is not needed.
                    input.discard_all();
                    Step::NeedMore
                }
                UpdateState::Finalize => self.on_finalize()?,
                UpdateState::Finished => {
                    input.discard_all();
                    Step::Done
                }
            };
            match step {
                Step::Continue => continue,
                Step::NeedMore | Step::Done => return Ok(()),
            }
        }
    }

    fn on_manifest_header(&mut self, input: &mut InputView<'_>) -> Result<Step, UpdateError> {
        let Some(header) = archive::read_local_header(input)? else {
            input.save();
            return Ok(Step::NeedMore);
        };
        if header.name != MANIFEST_FILENAME {
            error!("Got {} instead of {}", header.name, MANIFEST_FILENAME);
            return Err(UpdateError::UnexpectedEntry {
                expected: MANIFEST_FILENAME,
                found: header.name,
            });
        }
        self.start_entry(header);
        self.set_state(UpdateState::AwaitingManifest);
        Ok(Step::Continue)
    }

    fn on_manifest(&mut self, input: &mut InputView<'_>) -> Result<Step, UpdateError> {
        let size = self.entry.size as usize;
        if u64::from(self.entry.size) > self.options.max_manifest_size {
            return Err(UpdateError::ManifestTooLarge {
                size: u64::from(self.entry.size),
                limit: self.options.max_manifest_size,
            });
        }
        // The manifest is parsed as a whole, so buffer until complete.
        if input.len() < size {
            input.save();
            return Ok(Step::NeedMore);
        }

        let body = &input.data()[..size];
        let actual = checksum::crc32(body);
        if !checksum::matches_declared(self.crc_declared, actual) {
            return Err(UpdateError::ChecksumMismatch {
                name: self.entry.name.clone(),
                expected: self.crc_declared,
                actual,
            });
        }

        let mut copy = Vec::new();
        copy.try_reserve_exact(size)
            .map_err(|_| UpdateError::OutOfMemory)?;
        copy.extend_from_slice(body);
        input.consume(size);
        self.entry.processed = self.entry.size;

        let manifest = Manifest::parse(&copy)?;
        let firmware = &self.options.firmware;
        info!(
            "FW: {} {} {} {} -> {} {}",
            manifest.name,
            manifest.platform,
            firmware.version,
            firmware.build_id,
            manifest.version,
            manifest.build_id
        );
        manifest.check_platform(&firmware.platform)?;

        if self.options.ignore_same_version && manifest.is_same_version(firmware) {
            self.manifest = Some(manifest);
            self.status_message = Some("Version is the same as current".to_string());
            self.result = UpdateResult::UpToDate;
            return Ok(Step::Done);
        }

        if let Err(e) = self.ctx.begin(&manifest.parts) {
            error!("Bad manifest: {}", e);
            return Err(e.into());
        }

        let message = format!(
            "App: {} FW: {} Build ID: {}",
            manifest.name, manifest.version, manifest.build_id
        );
        self.manifest = Some(manifest);
        self.events
            .emit(OtaState::Begin, message, Some(self.snapshot()));

        self.set_state(UpdateState::SkippingDescriptor);
        Ok(Step::Continue)
    }

    fn on_file_header(&mut self, input: &mut InputView<'_>) -> Result<Step, UpdateError> {
        match archive::is_central_directory(input.data()) {
            None => {
                input.save();
                return Ok(Step::NeedMore);
            }
            Some(true) => {
                debug!("Reached the end of archive");
                self.set_state(UpdateState::WriteFinished);
                return Ok(Step::Continue);
            }
            Some(false) => {}
        }

        let Some(header) = archive::read_local_header(input)? else {
            input.save();
            return Ok(Step::NeedMore);
        };
        self.start_entry(header);

        match self.ctx.file_begin(&self.entry) {
            FileAction::Abort => {
                let msg = self
                    .ctx
                    .status_message()
                    .unwrap_or_else(|| format!("Refused to write {}", self.entry.name));
                Err(UpdateError::Backend(msg))
            }
            FileAction::Skip => {
                debug!("Skipping {}", self.entry.name);
                self.set_state(UpdateState::SkippingData);
                Ok(Step::Continue)
            }
            FileAction::Write => {
                self.crc.reset();
                self.progress.reset_for_entry();
                self.set_state(UpdateState::AwaitingFile);
                Ok(Step::Continue)
            }
        }
    }

    fn on_file_data(&mut self, input: &mut InputView<'_>) -> Result<Step, UpdateError> {
        let offered = (self.entry.remaining() as usize).min(input.len());
        if offered > 0 {
            let data = &input.data()[..offered];
            let consumed = self.ctx.file_data(&self.entry, data)?;
            if consumed > offered {
                return Err(UpdateError::Backend(format!(
                    "Backend consumed {consumed} of {offered} bytes"
                )));
            }
            self.crc.update(&data[..consumed]);
            input.consume(consumed);
            self.entry.processed += consumed as u32;
        }
        self.report_progress();

        let left = self.entry.remaining() as usize;
        if left > input.len() {
            input.save();
            return Ok(Step::NeedMore);
        }

        self.finalize_write(input, left)?;
        self.set_state(UpdateState::SkippingDescriptor);
        Ok(Step::Continue)
    }

    /// Verify the entry checksum and hand the last bytes to the backend.
    fn finalize_write(&mut self, input: &mut InputView<'_>, len: usize) -> Result<(), UpdateError> {
        let tail = &input.data()[..len];
        self.crc.update(tail);
        let actual = self.crc.value();
        if !checksum::matches_declared(self.crc_declared, actual) {
            return Err(UpdateError::ChecksumMismatch {
                name: self.entry.name.clone(),
                expected: self.crc_declared,
                actual,
            });
        }

        let consumed = self.ctx.file_end(&self.entry, tail)?;
        if consumed != len {
            return Err(UpdateError::IncompleteWrite {
                expected: len,
                consumed,
            });
        }
        input.consume(len);
        self.entry.processed += len as u32;
        debug!("{} written, CRC32 0x{:08x}", self.entry.name, actual);
        Ok(())
    }

    fn on_skip_data(&mut self, input: &mut InputView<'_>) -> Step {
        let n = (self.entry.remaining() as usize).min(input.len());
        input.consume(n);
        self.entry.processed += n as u32;
        self.report_progress();

        if !self.entry.is_complete() {
            input.save();
            return Step::NeedMore;
        }
        self.set_state(UpdateState::SkippingDescriptor);
        Step::Continue
    }

    fn on_skip_descriptor(&mut self) -> Step {
        let has_descriptor = self.has_descriptor;
        debug!("Has descriptor: {}", has_descriptor);
        self.clear_entry();
        if has_descriptor {
            // Sizes and CRC after the body; only its length matters.
            self.entry.size = DATA_DESCRIPTOR_LEN as u32;
            self.set_state(UpdateState::SkippingData);
        } else {
            self.set_state(UpdateState::AwaitingFileHeader);
        }
        Step::Continue
    }

    fn on_finalize(&mut self) -> Result<Step, UpdateError> {
        self.status_message = Some("Update applied, finalizing".to_string());
        self.events.emit(
            OtaState::Finalizing,
            format!("commit timeout {}", self.commit_timeout),
            None,
        );
        if self.commit_timeout > 0 {
            self.options.commit_store.save(self.commit_timeout)?;
        }
        self.ctx.finalize()?;
        self.result = UpdateResult::Success;
        self.needs_reboot = true;
        Ok(Step::Done)
    }

    fn finish(&mut self) {
        if self.state == UpdateState::Finished {
            return;
        }
        self.set_state(UpdateState::Finished);

        let message = self.status_message.as_deref().unwrap_or("???");
        self.events.emit(
            OtaState::Done,
            format!("Finished: {} {}", self.result, message),
            Some(self.snapshot()),
        );

        if let Some(callback) = self.on_complete.take() {
            callback(&Completion {
                result: self.result,
                status_message: message.to_string(),
                needs_reboot: self.needs_reboot,
            });
        }
    }

    fn report_progress(&mut self) {
        let now = Instant::now();
        if !self.progress.should_report_at(now) {
            return;
        }
        let message = self.progress.message(&self.entry);
        self.events
            .emit(OtaState::Progress, message, Some(self.snapshot()));
        self.progress.mark_reported_at(now);
    }

    fn start_entry(&mut self, header: LocalHeader) {
        self.crc_declared = header.crc32;
        self.has_descriptor = header.has_descriptor();
        self.entry = FileInfo::new(header.name, header.size);
        self.crc.reset();
    }

    fn clear_entry(&mut self) {
        self.entry = FileInfo::default();
        self.crc_declared = 0;
        self.has_descriptor = false;
        self.crc.reset();
    }

    fn snapshot(&self) -> UpdateSnapshot {
        UpdateSnapshot {
            manifest: self.manifest.clone(),
            entry: Some(self.entry.clone()),
        }
    }

    fn set_state(&mut self, state: UpdateState) {
        debug!("Update state {} -> {}", self.state, state);
        self.state = state;
    }
}
