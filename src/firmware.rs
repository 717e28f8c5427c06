//! Firmware upload
//!
//! A [`FirmwareUploadJob`] describes what to write; the
//! [`FirmwareUploadStateMachine`] drives it through
//!
//! `Idle → Erasing → Writing → Verifying → Rebooting → Done`
//!
//! ending in `Cancelled` or `Failed` when interrupted. Every step waits for the
//! target's acknowledgement before the next one, so writes are never pipelined.
//!
//! Application images are preceded by a size/CRC header written at address 0,
//! with the image itself at address 6 where the bootloader expects it.
//! Bootloader images are written raw at [`BOOTLOADER_OFFSET`] without erasing.

use crate::config::{FirmwareConfig, BOOTLOADER_OFFSET};
use crate::error::{FirmwareUploadError, LinkError, Result};
use crate::interface::{InterfaceEvent, InterfaceHandle};
use crate::protocol::{crc16, Request, Response};
use crate::types::CancelToken;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Length of the size/CRC header in front of application images
pub const APP_HEADER_LEN: u32 = 6;

/// Check that `len` bytes written from `start_address` stay addressable
///
/// Returns the address one past the last byte.
fn image_end(start_address: u32, len: usize) -> std::result::Result<u32, FirmwareUploadError> {
    u32::try_from(len)
        .ok()
        .and_then(|len| start_address.checked_add(len))
        .ok_or_else(|| {
            FirmwareUploadError::InvalidImage(format!(
                "image of {} bytes at 0x{:X} exceeds the 32-bit address space",
                len, start_address
            ))
        })
}

/// Upload progress through the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Erasing,
    Writing,
    Verifying,
    Rebooting,
    Done,
    Cancelled,
    Failed,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Done | UploadState::Cancelled | UploadState::Failed
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadState::Idle => "Idle",
            UploadState::Erasing => "Buffer Erase",
            UploadState::Writing => "FW Data Write",
            UploadState::Verifying => "Verifying",
            UploadState::Rebooting => "Rebooting",
            UploadState::Done => "FW Upload Done",
            UploadState::Cancelled => "Cancelled",
            UploadState::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// One image to upload
#[derive(Debug, Clone)]
pub struct FirmwareUploadJob {
    image: Vec<u8>,
    start_address: u32,
    chunk_size: usize,
    verify: bool,
    is_bootloader: bool,
    bytes_sent: usize,
    state: UploadState,
}

impl FirmwareUploadJob {
    /// Application image, written behind the size/CRC header
    pub fn for_app_image(image: Vec<u8>, config: &FirmwareConfig) -> Result<Self> {
        Self::new(image, APP_HEADER_LEN, false, config)
    }

    /// Bootloader image, written raw at the bootloader base address
    pub fn for_bootloader(image: Vec<u8>, config: &FirmwareConfig) -> Result<Self> {
        Self::new(image, BOOTLOADER_OFFSET, true, config)
    }

    fn new(
        image: Vec<u8>,
        start_address: u32,
        is_bootloader: bool,
        config: &FirmwareConfig,
    ) -> Result<Self> {
        if image.is_empty() {
            return Err(FirmwareUploadError::InvalidImage("image is empty".to_string()).into());
        }
        image_end(start_address, image.len())?;
        if config.chunk_size == 0 || config.chunk_size > u16::MAX as usize {
            return Err(LinkError::Config(format!(
                "invalid firmware chunk size {}",
                config.chunk_size
            )));
        }
        Ok(Self {
            image,
            start_address,
            chunk_size: config.chunk_size,
            verify: config.verify,
            is_bootloader,
            bytes_sent: 0,
            state: UploadState::Idle,
        })
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    pub fn is_bootloader(&self) -> bool {
        self.is_bootloader
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn total(&self) -> usize {
        self.image.len()
    }

    /// Fraction of the image acknowledged by the target
    pub fn progress(&self) -> f64 {
        self.bytes_sent as f64 / self.image.len() as f64
    }

    pub fn chunk_count(&self) -> usize {
        self.image.len().div_ceil(self.chunk_size)
    }

    /// `[u32 size][u16 crc16]` written at address 0, application images only
    pub fn header(&self) -> Option<[u8; 6]> {
        if self.is_bootloader {
            return None;
        }
        let size = (self.image.len() as u32).to_be_bytes();
        let crc = crc16(&self.image).to_be_bytes();
        Some([size[0], size[1], size[2], size[3], crc[0], crc[1]])
    }

    /// Target address and data of every chunk
    pub fn chunks(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        // the whole image was checked to fit behind start_address
        let mut address = self.start_address;
        self.image.chunks(self.chunk_size).map(move |chunk| {
            let at = address;
            address = address.wrapping_add(chunk.len() as u32);
            (at, chunk)
        })
    }
}

/// What the state machine needs from a connected target
#[async_trait]
pub trait FirmwareTarget: Send + Sync {
    /// Send a request and wait for its reply
    async fn request(&self, request: Request, timeout: Duration) -> Result<Response>;

    /// Send a request without waiting
    async fn send(&self, request: Request) -> Result<()>;

    /// Publish upload status
    fn report(&self, status: &str, progress: f64, ongoing: bool);

    /// Identify the firmware again once the upload finished
    async fn reidentify(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FirmwareTarget for InterfaceHandle {
    async fn request(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.request_with_timeout(request, timeout).await
    }

    async fn send(&self, request: Request) -> Result<()> {
        InterfaceHandle::send(self, request).await
    }

    fn report(&self, status: &str, progress: f64, ongoing: bool) {
        self.events().publish(InterfaceEvent::FwUploadStatus {
            status: status.to_string(),
            progress,
            ongoing,
        });
    }

    async fn reidentify(&self) -> Result<()> {
        InterfaceHandle::reidentify(self).await
    }
}

/// Drives a [`FirmwareUploadJob`] against a target
pub struct FirmwareUploadStateMachine<T> {
    target: T,
    config: FirmwareConfig,
    cancel: CancelToken,
}

impl<T: FirmwareTarget> FirmwareUploadStateMachine<T> {
    pub fn new(target: T, config: FirmwareConfig, cancel: CancelToken) -> Self {
        Self {
            target,
            config,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run the job to a terminal state
    ///
    /// Flash already written is not reverted on failure or cancellation.
    pub async fn run(&self, job: &mut FirmwareUploadJob) -> Result<()> {
        tracing::info!(
            "Uploading {} byte {} image in {} chunks",
            job.total(),
            if job.is_bootloader { "bootloader" } else { "application" },
            job.chunk_count()
        );
        job.bytes_sent = 0;

        let result = self.run_steps(job).await;
        match &result {
            Ok(()) => {
                job.state = UploadState::Done;
                tracing::info!("Firmware upload done");
                self.target.report(&UploadState::Done.to_string(), 1.0, false);
            }
            Err(LinkError::Cancelled) => {
                job.state = UploadState::Cancelled;
                tracing::info!("Firmware upload cancelled at {} bytes", job.bytes_sent);
                self.target
                    .report(&UploadState::Cancelled.to_string(), 0.0, false);
            }
            Err(e) => {
                job.state = UploadState::Failed;
                tracing::error!("Firmware upload failed: {}", e);
                self.target.report(&failure_status(e), 0.0, false);
            }
        }
        result
    }

    async fn run_steps(&self, job: &mut FirmwareUploadJob) -> Result<()> {
        if !job.is_bootloader {
            self.enter(job, UploadState::Erasing)?;
            self.erase(job).await?;
        }

        self.enter(job, UploadState::Writing)?;
        if let Some(header) = job.header() {
            self.target.report("CRC/Size Write", 0.0, true);
            self.write_with_retry(0, &header).await?;
        }
        let chunks: Vec<(u32, Vec<u8>)> = job
            .chunks()
            .map(|(address, data)| (address, data.to_vec()))
            .collect();
        for (address, data) in chunks {
            self.check_cancel()?;
            self.write_with_retry(address, &data).await?;
            job.bytes_sent += data.len();
            tracing::debug!("Wrote {}/{} bytes", job.bytes_sent, job.total());
            self.target
                .report(&UploadState::Writing.to_string(), job.progress(), true);
        }

        if job.verify {
            self.enter(job, UploadState::Verifying)?;
            self.verify(job).await?;
        }

        self.enter(job, UploadState::Rebooting)?;
        let reboot = if job.is_bootloader {
            Request::Reboot
        } else {
            Request::JumpToBootloader
        };
        self.target.send(reboot).await?;
        if let Err(e) = self.target.reidentify().await {
            tracing::debug!("Re-identification after upload not started: {}", e);
        }
        Ok(())
    }

    fn enter(&self, job: &mut FirmwareUploadJob, state: UploadState) -> Result<()> {
        self.check_cancel()?;
        tracing::debug!("Firmware upload: {:?} -> {:?}", job.state, state);
        job.state = state;
        self.target.report(&state.to_string(), job.progress(), true);
        Ok(())
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(LinkError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn exchange(&self, request: Request, timeout: Duration) -> Result<Response> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LinkError::Cancelled),
            response = self.target.request(request, timeout) => response,
        }
    }

    async fn erase(&self, job: &FirmwareUploadJob) -> Result<()> {
        let request = Request::EraseNewApp {
            size: job.total() as u32,
        };
        match self.exchange(request, self.config.erase_timeout()).await {
            Ok(Response::EraseNewApp { ok: true }) => Ok(()),
            Ok(Response::EraseNewApp { ok: false }) => Err(FirmwareUploadError::EraseRejected.into()),
            Ok(other) => Err(LinkError::Decode(format!(
                "unexpected erase reply {:?}",
                other.opcode()
            ))),
            Err(LinkError::CommandTimeout { .. }) => Err(FirmwareUploadError::EraseTimeout.into()),
            Err(e) => Err(e),
        }
    }

    async fn write_with_retry(&self, offset: u32, data: &[u8]) -> Result<()> {
        let attempts = self.config.retries + 1;
        for attempt in 1..=attempts {
            let request = Request::WriteNewAppData {
                offset,
                data: data.to_vec(),
            };
            match self.exchange(request, self.config.ack_timeout()).await {
                Ok(Response::WriteNewAppData { ok: true, .. }) => return Ok(()),
                Ok(Response::WriteNewAppData { ok: false, .. }) => {
                    tracing::warn!("Write at {} rejected (attempt {})", offset, attempt);
                    if attempt == attempts {
                        return Err(FirmwareUploadError::WriteRejected { offset }.into());
                    }
                }
                Ok(other) => {
                    return Err(LinkError::Decode(format!(
                        "unexpected write reply {:?}",
                        other.opcode()
                    )))
                }
                Err(LinkError::CommandTimeout { .. }) | Err(LinkError::Decode(_)) => {
                    tracing::warn!("Write at {} not acknowledged (attempt {})", offset, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(FirmwareUploadError::WriteTimeout { offset, attempts }.into())
    }

    async fn verify(&self, job: &FirmwareUploadJob) -> Result<()> {
        if let Some(header) = job.header() {
            self.verify_range(0, &header).await?;
        }
        for (address, data) in job.chunks() {
            self.check_cancel()?;
            self.verify_range(address, data).await?;
        }
        Ok(())
    }

    async fn verify_range(&self, address: u32, expected: &[u8]) -> Result<()> {
        let request = Request::MemRead {
            address,
            len: expected.len() as u16,
        };
        let read_failed = || LinkError::from(FirmwareUploadError::VerifyReadFailed { address });
        match self.exchange(request, self.config.ack_timeout()).await {
            Ok(Response::MemRead {
                address: read_at,
                data,
            }) if read_at == address && data.len() == expected.len() => {
                match data.iter().zip(expected).position(|(a, b)| a != b) {
                    Some(i) => Err(FirmwareUploadError::VerifyMismatch {
                        address: address + i as u32,
                    }
                    .into()),
                    None => Ok(()),
                }
            }
            Err(LinkError::Cancelled) => Err(LinkError::Cancelled),
            Ok(_) | Err(_) => Err(read_failed()),
        }
    }
}

fn failure_status(err: &LinkError) -> String {
    match err {
        LinkError::FirmwareUpload(FirmwareUploadError::EraseTimeout) => {
            "Buffer Erase Timeout".to_string()
        }
        LinkError::FirmwareUpload(FirmwareUploadError::WriteTimeout { .. }) => {
            "FW Data Write Timeout".to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommPacketId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Target answering from a fake flash, with scripted faults
    #[derive(Default)]
    struct FakeTarget {
        log: Mutex<Vec<Request>>,
        flash: Mutex<Vec<u8>>,
        reports: Mutex<Vec<(String, f64, bool)>>,
        drop_writes: Mutex<u32>,
        nack_writes: Mutex<u32>,
        reject_erase: bool,
        cancel_after_writes: Option<(usize, CancelToken)>,
    }

    impl FakeTarget {
        fn writes(&self) -> Vec<u32> {
            self.log
                .lock()
                .iter()
                .filter_map(|r| match r {
                    Request::WriteNewAppData { offset, .. } => Some(*offset),
                    _ => None,
                })
                .collect()
        }

        fn opcodes(&self) -> Vec<CommPacketId> {
            self.log.lock().iter().map(Request::opcode).collect()
        }
    }

    #[async_trait]
    impl FirmwareTarget for Arc<FakeTarget> {
        async fn request(&self, request: Request, timeout: Duration) -> Result<Response> {
            self.log.lock().push(request.clone());
            let timed_out = LinkError::CommandTimeout {
                opcode: request.opcode(),
                after: timeout,
            };
            match request {
                Request::EraseNewApp { .. } => Ok(Response::EraseNewApp {
                    ok: !self.reject_erase,
                }),
                Request::WriteNewAppData { offset, data } => {
                    if let Some((after, token)) = &self.cancel_after_writes {
                        if self.writes().len() == *after {
                            token.cancel();
                        }
                    }
                    {
                        let mut drops = self.drop_writes.lock();
                        if *drops > 0 {
                            *drops -= 1;
                            return Err(timed_out);
                        }
                    }
                    {
                        let mut nacks = self.nack_writes.lock();
                        if *nacks > 0 {
                            *nacks -= 1;
                            return Ok(Response::WriteNewAppData {
                                ok: false,
                                offset: Some(offset),
                            });
                        }
                    }
                    let mut flash = self.flash.lock();
                    let end = offset as usize + data.len();
                    if flash.len() < end {
                        flash.resize(end, 0xFF);
                    }
                    flash[offset as usize..end].copy_from_slice(&data);
                    Ok(Response::WriteNewAppData {
                        ok: true,
                        offset: Some(offset),
                    })
                }
                Request::MemRead { address, len } => {
                    let flash = self.flash.lock();
                    let start = (address as usize).min(flash.len());
                    let end = (start + len as usize).min(flash.len());
                    Ok(Response::MemRead {
                        address,
                        data: flash[start..end].to_vec(),
                    })
                }
                _ => Err(timed_out),
            }
        }

        async fn send(&self, request: Request) -> Result<()> {
            self.log.lock().push(request);
            Ok(())
        }

        fn report(&self, status: &str, progress: f64, ongoing: bool) {
            self.reports
                .lock()
                .push((status.to_string(), progress, ongoing));
        }
    }

    fn config(chunk_size: usize) -> FirmwareConfig {
        FirmwareConfig {
            chunk_size,
            ..FirmwareConfig::default()
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_job_layout() {
        let job = FirmwareUploadJob::for_app_image(image(450), &config(200)).unwrap();
        assert_eq!(job.chunk_count(), 3);
        let addresses: Vec<u32> = job.chunks().map(|(a, _)| a).collect();
        assert_eq!(addresses, vec![6, 206, 406]);
        assert_eq!(job.chunks().last().map(|(_, d)| d.len()), Some(50));

        let header = job.header().unwrap();
        assert_eq!(&header[..4], &450u32.to_be_bytes());
        assert_eq!(&header[4..], &crc16(job.image()).to_be_bytes());

        let boot = FirmwareUploadJob::for_bootloader(image(10), &config(200)).unwrap();
        assert!(boot.header().is_none());
        assert_eq!(boot.chunks().next().map(|(a, _)| a), Some(BOOTLOADER_OFFSET));
    }

    #[test]
    fn test_rejects_empty_image() {
        assert!(matches!(
            FirmwareUploadJob::for_app_image(Vec::new(), &config(200)),
            Err(LinkError::FirmwareUpload(FirmwareUploadError::InvalidImage(_)))
        ));
        assert!(FirmwareUploadJob::for_app_image(vec![1], &config(0)).is_err());
    }

    #[test]
    fn test_image_must_fit_address_space() {
        let room = (u32::MAX - BOOTLOADER_OFFSET) as usize;
        assert_eq!(image_end(BOOTLOADER_OFFSET, room), Ok(u32::MAX));
        assert!(matches!(
            image_end(BOOTLOADER_OFFSET, room + 1),
            Err(FirmwareUploadError::InvalidImage(_))
        ));
        assert!(image_end(APP_HEADER_LEN, u32::MAX as usize).is_err());
        assert_eq!(image_end(APP_HEADER_LEN, 450), Ok(456));
    }

    #[test]
    fn test_last_chunk_address_near_top_of_flash() {
        let job = FirmwareUploadJob::new(image(300), u32::MAX - 300, true, &config(128)).unwrap();
        let addresses: Vec<u32> = job.chunks().map(|(a, _)| a).collect();
        assert_eq!(
            addresses,
            vec![u32::MAX - 300, u32::MAX - 172, u32::MAX - 44]
        );
        assert!(FirmwareUploadJob::new(image(300), u32::MAX - 299, true, &config(128)).is_err());
    }

    #[tokio::test]
    async fn test_app_upload_sequence() {
        let target = Arc::new(FakeTarget::default());
        let machine =
            FirmwareUploadStateMachine::new(target.clone(), config(200), CancelToken::new());
        let mut job = FirmwareUploadJob::for_app_image(image(1000), &config(200))
            .unwrap()
            .with_verify(true);

        machine.run(&mut job).await.unwrap();

        assert_eq!(job.state(), UploadState::Done);
        assert_eq!(job.bytes_sent(), 1000);
        assert_eq!(target.writes(), vec![0, 6, 206, 406, 606, 806]);
        let ops = target.opcodes();
        assert_eq!(ops.first(), Some(&CommPacketId::EraseNewApp));
        assert_eq!(ops.last(), Some(&CommPacketId::JumpToBootloader));
        assert_eq!(&target.flash.lock()[6..], job.image());

        let reports = target.reports.lock();
        assert_eq!(reports.last(), Some(&("FW Upload Done".to_string(), 1.0, false)));
        let progress: Vec<f64> = reports
            .iter()
            .filter(|(s, _, _)| s == "FW Data Write")
            .map(|(_, p, _)| *p)
            .collect();
        assert_eq!(progress.last(), Some(&1.0));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_bootloader_skips_erase_and_reboots() {
        let target = Arc::new(FakeTarget::default());
        let machine =
            FirmwareUploadStateMachine::new(target.clone(), config(64), CancelToken::new());
        let mut job = FirmwareUploadJob::for_bootloader(image(100), &config(64)).unwrap();

        machine.run(&mut job).await.unwrap();

        let ops = target.opcodes();
        assert!(!ops.contains(&CommPacketId::EraseNewApp));
        assert_eq!(ops.last(), Some(&CommPacketId::Reboot));
        assert_eq!(target.writes(), vec![BOOTLOADER_OFFSET, BOOTLOADER_OFFSET + 64]);
    }

    #[tokio::test]
    async fn test_write_retries_then_fails() {
        let target = Arc::new(FakeTarget {
            drop_writes: Mutex::new(2),
            ..FakeTarget::default()
        });
        let machine =
            FirmwareUploadStateMachine::new(target.clone(), config(200), CancelToken::new());
        let mut job = FirmwareUploadJob::for_bootloader(image(300), &config(200)).unwrap();
        machine.run(&mut job).await.unwrap();
        // two dropped attempts, then both chunks
        assert_eq!(target.writes().len(), 4);

        let target = Arc::new(FakeTarget {
            nack_writes: Mutex::new(100),
            ..FakeTarget::default()
        });
        let cfg = config(200);
        let machine = FirmwareUploadStateMachine::new(target.clone(), cfg.clone(), CancelToken::new());
        let mut job = FirmwareUploadJob::for_bootloader(image(300), &cfg).unwrap();
        let err = machine.run(&mut job).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::FirmwareUpload(FirmwareUploadError::WriteRejected { .. })
        ));
        assert_eq!(target.writes().len() as u32, cfg.retries + 1);
        assert_eq!(job.state(), UploadState::Failed);
    }

    #[tokio::test]
    async fn test_erase_rejection_fails_job() {
        let target = Arc::new(FakeTarget {
            reject_erase: true,
            ..FakeTarget::default()
        });
        let machine =
            FirmwareUploadStateMachine::new(target.clone(), config(200), CancelToken::new());
        let mut job = FirmwareUploadJob::for_app_image(image(10), &config(200)).unwrap();

        let err = machine.run(&mut job).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::FirmwareUpload(FirmwareUploadError::EraseRejected)
        ));
        assert!(target.writes().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let cancel = CancelToken::new();
        // header plus two chunks acknowledged, then cancelled
        let target = Arc::new(FakeTarget {
            cancel_after_writes: Some((3, cancel.clone())),
            ..FakeTarget::default()
        });
        let machine = FirmwareUploadStateMachine::new(target.clone(), config(100), cancel);
        let mut job = FirmwareUploadJob::for_app_image(image(1000), &config(100)).unwrap();

        assert!(matches!(machine.run(&mut job).await, Err(LinkError::Cancelled)));
        assert_eq!(job.state(), UploadState::Cancelled);
        assert_eq!(target.writes().len(), 3);
        assert!(!target.opcodes().contains(&CommPacketId::JumpToBootloader));
    }

    #[tokio::test]
    async fn test_verify_mismatch() {
        struct Corrupting(Arc<FakeTarget>);

        #[async_trait]
        impl FirmwareTarget for Corrupting {
            async fn request(&self, request: Request, timeout: Duration) -> Result<Response> {
                let response = self.0.request(request, timeout).await?;
                Ok(match response {
                    Response::MemRead { address, mut data } if address == 6 => {
                        data[3] ^= 0x01;
                        Response::MemRead { address, data }
                    }
                    other => other,
                })
            }
            async fn send(&self, request: Request) -> Result<()> {
                self.0.send(request).await
            }
            fn report(&self, status: &str, progress: f64, ongoing: bool) {
                self.0.report(status, progress, ongoing)
            }
        }

        let fake = Arc::new(FakeTarget::default());
        let machine = FirmwareUploadStateMachine::new(
            Corrupting(fake.clone()),
            config(200),
            CancelToken::new(),
        );
        let mut job = FirmwareUploadJob::for_app_image(image(300), &config(200))
            .unwrap()
            .with_verify(true);

        let err = machine.run(&mut job).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::FirmwareUpload(FirmwareUploadError::VerifyMismatch { address: 9 })
        ));
        assert!(!fake.opcodes().contains(&CommPacketId::JumpToBootloader));
    }
}
