//! Local admission control.
//!
//! Every job admitted on this worker holds a slot tuple: one permit from the
//! total-concurrency semaphore plus one from its class semaphore
//! (`gpu`/`cpu`/`probe`), and for hardware video paths one encode session on
//! a concrete GPU. The tuple lives in an [`AdmissionTicket`]; dropping the
//! ticket returns every slot and wakes the oldest queued waiter.
//!
//! Encoder selection is deterministic: preferred accelerator first, then the
//! remaining hardware paths, then software, first fit wins.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use castor_contracts::codec::{encoder_produces, hw_kind_of};
use castor_contracts::{
    Capabilities, ConcurrencyUpdate, GpuInfo, GpuUtilization, HwAccelKind, JobSpec,
    GpuExhaustedPolicy, TranscodeError, TranscodeErrorCode,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClass {
    Gpu,
    Cpu,
    Probe,
}

impl SlotClass {
    fn index(self) -> usize {
        match self {
            Self::Cpu => CAP_CPU,
            Self::Gpu => CAP_GPU,
            Self::Probe => CAP_PROBE,
        }
    }
}

const CAP_TOTAL: usize = 0;
const CAP_CPU: usize = 1;
const CAP_GPU: usize = 2;
const CAP_PROBE: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("worker is draining")]
    Draining,
    #[error("concurrency capacity exhausted")]
    CapacityExhausted,
    #[error("all GPU encode sessions in use")]
    GpuSessionsExhausted,
    #[error("queued admission timed out")]
    QueueTimeout,
    #[error("no encoder available for codec {codec}")]
    NoEncoder { codec: String },
}

impl AdmissionError {
    /// The error carried in a failure `Ack` back to the scheduler.
    pub fn to_transcode_error(&self) -> TranscodeError {
        match self {
            Self::Draining => TranscodeError::recoverable(
                TranscodeErrorCode::Internal,
                "worker is draining, not accepting jobs",
            ),
            Self::CapacityExhausted => TranscodeError::recoverable(
                TranscodeErrorCode::Internal,
                "worker concurrency capacity exhausted",
            ),
            Self::GpuSessionsExhausted | Self::QueueTimeout => TranscodeError::recoverable(
                TranscodeErrorCode::SessionLimitReached,
                self.to_string(),
            ),
            Self::NoEncoder { codec } => TranscodeError::fatal(
                TranscodeErrorCode::CodecUnsupported,
                format!("no encoder available for {codec}"),
            ),
        }
    }
}

#[derive(Debug)]
struct GpuSlot {
    info: GpuInfo,
    active_encode: AtomicU32,
    active_decode: AtomicU32,
}

#[derive(Debug, Default)]
struct Shared {
    /// Permits to swallow instead of returning, used to lower caps without
    /// revoking slots in use.
    debts: [AtomicU32; 4],
    waiters: std::sync::Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl Shared {
    fn settle(&self, index: usize, permit: OwnedSemaphorePermit) {
        let debt = &self.debts[index];
        let mut current = debt.load(Ordering::Acquire);
        while current > 0 {
            match debt.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    permit.forget();
                    return;
                }
                Err(actual) => current = actual,
            }
        }
        drop(permit);
    }

    fn wake_one(&self) {
        let mut waiters = self.waiters.lock().expect("waiter list poisoned");
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
    }
}

/// The slot tuple held for one admitted job. Dropping it releases
/// everything and wakes the oldest queued waiter.
#[derive(Debug)]
pub struct AdmissionTicket {
    class: SlotClass,
    total: Option<OwnedSemaphorePermit>,
    class_permit: Option<OwnedSemaphorePermit>,
    gpu: Option<Arc<GpuSlot>>,
    shared: Arc<Shared>,
}

impl AdmissionTicket {
    pub fn class(&self) -> SlotClass {
        self.class
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            gpu.active_encode.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(permit) = self.class_permit.take() {
            self.shared.settle(self.class.index(), permit);
        }
        if let Some(permit) = self.total.take() {
            self.shared.settle(CAP_TOTAL, permit);
        }
        self.shared.wake_one();
    }
}

/// Outcome of a successful admission: the slot tuple plus the concrete
/// encoders selected for the job.
#[derive(Debug)]
pub struct Admission {
    pub video_encoder: Option<String>,
    pub audio_encoder: Option<String>,
    pub hw_accel: Option<HwAccelKind>,
    pub hw_device: Option<String>,
    pub gpu_index: Option<u32>,
    pub ticket: AdmissionTicket,
}

#[derive(Debug, Clone)]
struct Candidate {
    encoder: String,
    accel: Option<HwAccelKind>,
    device: Option<String>,
}

pub struct AdmissionController {
    caps: Capabilities,
    semaphores: [Arc<Semaphore>; 4],
    /// Current cap per semaphore, mutated only under `select_lock`.
    current_caps: Mutex<[u32; 4]>,
    gpus: Vec<Arc<GpuSlot>>,
    /// Serializes candidate walks so selection stays deterministic under
    /// concurrent `Start` commands.
    select_lock: Mutex<()>,
    shared: Arc<Shared>,
    draining: AtomicBool,
    queue_wait: Duration,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(caps: Capabilities, queue_wait: Duration) -> Self {
        let limits = [
            caps.max_concurrent_jobs,
            caps.max_cpu_jobs,
            caps.max_gpu_jobs,
            caps.max_probe_jobs,
        ];
        let gpus = caps
            .gpus
            .iter()
            .map(|info| {
                Arc::new(GpuSlot {
                    info: info.clone(),
                    active_encode: AtomicU32::new(0),
                    active_decode: AtomicU32::new(0),
                })
            })
            .collect();
        Self {
            semaphores: limits.map(|n| Arc::new(Semaphore::new(n as usize))),
            current_caps: Mutex::new(limits),
            gpus,
            select_lock: Mutex::new(()),
            shared: Arc::new(Shared::default()),
            draining: AtomicBool::new(false),
            queue_wait,
            caps,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Session occupancy as reported in heartbeats. Authoritative for the
    /// scheduler's overlay accounting.
    pub fn gpu_utilization(&self) -> Vec<GpuUtilization> {
        self.gpus
            .iter()
            .map(|g| GpuUtilization {
                index: g.info.index,
                active_encode_sessions: g.active_encode.load(Ordering::Acquire),
                active_decode_sessions: g.active_decode.load(Ordering::Acquire),
            })
            .collect()
    }

    /// Admit a transcode job, applying its GPU-exhausted policy. May park
    /// the caller when the policy is `queue`.
    pub async fn admit(&self, spec: &JobSpec) -> Result<Admission, AdmissionError> {
        match self.try_admit(spec, true).await {
            Err(AdmissionError::GpuSessionsExhausted) => {}
            other => return other,
        }

        match spec.gpu_exhausted_policy {
            GpuExhaustedPolicy::Reject => Err(AdmissionError::GpuSessionsExhausted),
            GpuExhaustedPolicy::Fallback => self.try_admit(spec, false).await,
            GpuExhaustedPolicy::Queue => self.admit_queued(spec).await,
        }
    }

    /// FIFO wait loop for the `queue` policy: park on the waiter list, retry
    /// on every release, re-park at the head if the freed slot did not fit.
    async fn admit_queued(&self, spec: &JobSpec) -> Result<Admission, AdmissionError> {
        let deadline = tokio::time::Instant::now() + self.queue_wait;
        let mut front = false;
        loop {
            let (tx, rx) = oneshot::channel();
            {
                let mut waiters = self.shared.waiters.lock().expect("waiter list poisoned");
                if front {
                    waiters.push_front(tx);
                } else {
                    waiters.push_back(tx);
                }
            }
            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                return Err(AdmissionError::QueueTimeout);
            }
            match self.try_admit(spec, true).await {
                Err(AdmissionError::GpuSessionsExhausted) => front = true,
                other => return other,
            }
        }
    }

    /// Admission for a probe-class job (stream analysis, not transcode).
    pub async fn admit_probe(&self) -> Result<AdmissionTicket, AdmissionError> {
        if self.is_draining() {
            return Err(AdmissionError::Draining);
        }
        let _guard = self.select_lock.lock().await;
        let total = self.try_permit(CAP_TOTAL)?;
        let class_permit = self.try_permit(CAP_PROBE)?;
        Ok(AdmissionTicket {
            class: SlotClass::Probe,
            total: Some(total),
            class_permit: Some(class_permit),
            gpu: None,
            shared: self.shared.clone(),
        })
    }

    async fn try_admit(
        &self,
        spec: &JobSpec,
        allow_hardware: bool,
    ) -> Result<Admission, AdmissionError> {
        if self.is_draining() {
            return Err(AdmissionError::Draining);
        }
        let _guard = self.select_lock.lock().await;

        let audio_encoder = self.pick_audio_encoder(spec)?;

        // Total slot is consumed for every job class; grab it first so a
        // full worker rejects before any candidate walk.
        let total = self.try_permit(CAP_TOTAL)?;

        if spec.video_passthrough() {
            let class_permit = self.try_permit(CAP_CPU)?;
            return Ok(Admission {
                video_encoder: None,
                audio_encoder,
                hw_accel: None,
                hw_device: None,
                gpu_index: None,
                ticket: AdmissionTicket {
                    class: SlotClass::Cpu,
                    total: Some(total),
                    class_permit: Some(class_permit),
                    gpu: None,
                    shared: self.shared.clone(),
                },
            });
        }

        let candidates = self.video_candidates(spec, allow_hardware);
        if candidates.is_empty() {
            return Err(AdmissionError::NoEncoder {
                codec: spec.target_video_codec.clone(),
            });
        }

        let mut sessions_exhausted = false;
        for candidate in candidates {
            match self.try_acquire_candidate(&candidate, spec) {
                Ok((class, class_permit, gpu)) => {
                    let gpu_index = gpu.as_ref().map(|g| g.info.index);
                    debug!(
                        encoder = %candidate.encoder,
                        accel = ?candidate.accel,
                        gpu = ?gpu_index,
                        "admission granted"
                    );
                    return Ok(Admission {
                        video_encoder: Some(candidate.encoder),
                        audio_encoder,
                        hw_accel: candidate.accel,
                        hw_device: candidate.device,
                        gpu_index,
                        ticket: AdmissionTicket {
                            class,
                            total: Some(total),
                            class_permit: Some(class_permit),
                            gpu,
                            shared: self.shared.clone(),
                        },
                    });
                }
                Err(exhausted_sessions) => sessions_exhausted |= exhausted_sessions,
            }
        }

        if sessions_exhausted {
            Err(AdmissionError::GpuSessionsExhausted)
        } else {
            Err(AdmissionError::CapacityExhausted)
        }
    }

    fn pick_audio_encoder(&self, spec: &JobSpec) -> Result<Option<String>, AdmissionError> {
        if spec.audio_passthrough() {
            return Ok(None);
        }
        // Audio is always a CPU concern unless an accelerator explicitly
        // advertises an audio encoder, which none of the supported ones do.
        self.caps
            .audio_encoders
            .iter()
            .find(|e| encoder_produces(e, &spec.target_audio_codec))
            .cloned()
            .map(Some)
            .ok_or_else(|| AdmissionError::NoEncoder {
                codec: spec.target_audio_codec.clone(),
            })
    }

    /// Candidate list in selection order: preferred accelerator, other
    /// hardware, software.
    fn video_candidates(&self, spec: &JobSpec, allow_hardware: bool) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        if allow_hardware {
            let preferred = spec.preferred_hw_accel.filter(|k| k.is_hardware());
            let mut push_accel = |kind: HwAccelKind| {
                if let Some(accel) = self.caps.accel(kind).filter(|a| a.available) {
                    for encoder in &accel.encoders {
                        if encoder_produces(encoder, &spec.target_video_codec) {
                            candidates.push(Candidate {
                                encoder: encoder.clone(),
                                accel: Some(kind),
                                device: accel.device.clone(),
                            });
                        }
                    }
                }
            };
            if let Some(kind) = preferred {
                push_accel(kind);
            }
            for accel in &self.caps.hw_accels {
                if Some(accel.kind) != preferred {
                    push_accel(accel.kind);
                }
            }
        }

        for encoder in &self.caps.video_encoders {
            if hw_kind_of(encoder).is_none()
                && encoder_produces(encoder, &spec.target_video_codec)
            {
                candidates.push(Candidate {
                    encoder: encoder.clone(),
                    accel: None,
                    device: None,
                });
            }
        }

        candidates
    }

    /// Acquire the class slot (and GPU session for hardware candidates).
    /// The boolean error distinguishes session exhaustion (policy applies)
    /// from plain capacity exhaustion (hard reject).
    fn try_acquire_candidate(
        &self,
        candidate: &Candidate,
        spec: &JobSpec,
    ) -> Result<(SlotClass, OwnedSemaphorePermit, Option<Arc<GpuSlot>>), bool> {
        match candidate.accel {
            Some(HwAccelKind::Cuda) => {
                let gpu = self.reserve_cuda_session(spec).ok_or(true)?;
                match self.try_permit(CAP_GPU) {
                    Ok(permit) => Ok((SlotClass::Gpu, permit, Some(gpu))),
                    Err(_) => {
                        gpu.active_encode.fetch_sub(1, Ordering::AcqRel);
                        Err(true)
                    }
                }
            }
            Some(_) => match self.try_permit(CAP_GPU) {
                Ok(permit) => Ok((SlotClass::Gpu, permit, None)),
                Err(_) => Err(true),
            },
            None => match self.try_permit(CAP_CPU) {
                Ok(permit) => Ok((SlotClass::Cpu, permit, None)),
                Err(_) => Err(false),
            },
        }
    }

    /// Find a CUDA GPU with session headroom, honoring the device hint.
    fn reserve_cuda_session(&self, spec: &JobSpec) -> Option<Arc<GpuSlot>> {
        let hinted: Option<u32> = spec
            .hw_device
            .as_deref()
            .and_then(|d| d.trim_start_matches("cuda:").parse().ok());

        let unlimited = self.caps.max_concurrent_jobs;
        let fits = |slot: &Arc<GpuSlot>| {
            slot.active_encode.load(Ordering::Acquire) < slot.info.encode_session_cap(unlimited)
        };

        let chosen = match hinted {
            Some(index) => self
                .gpus
                .iter()
                .find(|g| g.info.index == index)
                .filter(|g| fits(g)),
            None => self
                .gpus
                .iter()
                .filter(|g| fits(g))
                .min_by_key(|g| g.active_encode.load(Ordering::Acquire)),
        }?;

        chosen.active_encode.fetch_add(1, Ordering::AcqRel);
        Some(chosen.clone())
    }

    fn try_permit(&self, index: usize) -> Result<OwnedSemaphorePermit, AdmissionError> {
        self.semaphores[index]
            .clone()
            .try_acquire_owned()
            .map_err(|_| AdmissionError::CapacityExhausted)
    }

    /// Apply an `UPDATE_CONFIG` command. Raising a cap adds permits
    /// immediately; lowering one removes idle permits now and swallows the
    /// remainder as running jobs release.
    pub async fn update_caps(&self, update: &ConcurrencyUpdate) {
        let _guard = self.select_lock.lock().await;
        let mut current = self.current_caps.lock().await;
        let targets = [
            update.max_concurrent_jobs,
            update.max_cpu_jobs,
            update.max_gpu_jobs,
            update.max_probe_jobs,
        ];
        for (index, target) in targets.into_iter().enumerate() {
            let Some(target) = target else { continue };
            let old = current[index];
            if target > old {
                self.semaphores[index].add_permits((target - old) as usize);
            } else if target < old {
                let shrink = (old - target) as usize;
                let removed = self.semaphores[index].forget_permits(shrink);
                let debt = shrink - removed;
                if debt > 0 {
                    self.shared.debts[index].fetch_add(debt as u32, Ordering::AcqRel);
                }
            }
            current[index] = target;
        }
        info!(caps = ?*current, "concurrency caps updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_contracts::{GpuClass, HwAccel};

    fn gpu_caps(sessions: u32) -> Capabilities {
        Capabilities {
            video_encoders: vec!["h264_nvenc".into(), "libx264".into()],
            video_decoders: vec!["h264".into()],
            audio_encoders: vec!["aac".into()],
            audio_decoders: vec!["aac".into()],
            hw_accels: vec![HwAccel {
                kind: HwAccelKind::Cuda,
                device: None,
                available: true,
                encoders: vec!["h264_nvenc".into()],
                decoders: vec![],
                filtered_encoders: vec![],
            }],
            gpus: vec![GpuInfo {
                index: 0,
                name: "RTX 4070".into(),
                class: GpuClass::Consumer,
                driver_version: String::new(),
                max_encode_sessions: sessions,
                max_decode_sessions: 0,
            }],
            max_concurrent_jobs: 5,
            max_cpu_jobs: 4,
            max_gpu_jobs: 4,
            max_probe_jobs: 2,
        }
    }

    fn hw_job(policy: GpuExhaustedPolicy) -> JobSpec {
        JobSpec {
            source_video_codec: "h264".into(),
            source_audio_codec: "aac".into(),
            target_video_codec: "h264".into(),
            target_audio_codec: "aac".into(),
            preferred_hw_accel: Some(HwAccelKind::Cuda),
            gpu_exhausted_policy: policy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reject_policy_fails_when_sessions_run_out() {
        let controller = AdmissionController::new(gpu_caps(3), Duration::from_secs(1));
        let mut held = Vec::new();
        for _ in 0..3 {
            let admission = controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await.unwrap();
            assert_eq!(admission.video_encoder.as_deref(), Some("h264_nvenc"));
            held.push(admission);
        }
        let err = controller
            .admit(&hw_job(GpuExhaustedPolicy::Reject))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::GpuSessionsExhausted);
        assert_eq!(
            controller.gpu_utilization()[0].active_encode_sessions,
            3
        );
    }

    #[tokio::test]
    async fn fallback_policy_lands_on_software() {
        let controller = AdmissionController::new(gpu_caps(1), Duration::from_secs(1));
        let _hw = controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await.unwrap();
        let sw = controller
            .admit(&hw_job(GpuExhaustedPolicy::Fallback))
            .await
            .unwrap();
        assert_eq!(sw.video_encoder.as_deref(), Some("libx264"));
        assert_eq!(sw.hw_accel, None);
        assert_eq!(sw.ticket.class(), SlotClass::Cpu);
    }

    #[tokio::test]
    async fn queue_policy_wakes_on_release() {
        let controller = Arc::new(AdmissionController::new(gpu_caps(1), Duration::from_secs(5)));
        let first = controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await.unwrap();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.admit(&hw_job(GpuExhaustedPolicy::Queue)).await
            })
        };
        // Let the waiter reach the parked state before releasing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);

        let admission = waiter.await.unwrap().unwrap();
        assert_eq!(admission.video_encoder.as_deref(), Some("h264_nvenc"));
    }

    #[tokio::test]
    async fn queue_policy_times_out_without_release() {
        tokio::time::pause();
        let controller = AdmissionController::new(gpu_caps(1), Duration::from_secs(2));
        let _held = controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await.unwrap();
        let err = controller
            .admit(&hw_job(GpuExhaustedPolicy::Queue))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::QueueTimeout);
    }

    #[tokio::test]
    async fn draining_rejects_before_anything_else() {
        let controller = AdmissionController::new(gpu_caps(3), Duration::from_secs(1));
        controller.set_draining(true);
        let err = controller
            .admit(&hw_job(GpuExhaustedPolicy::Fallback))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Draining);
    }

    #[tokio::test]
    async fn missing_codec_is_a_hard_reject() {
        let controller = AdmissionController::new(gpu_caps(3), Duration::from_secs(1));
        let mut spec = hw_job(GpuExhaustedPolicy::Queue);
        spec.target_video_codec = "av1".into();
        let err = controller.admit(&spec).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::NoEncoder {
                codec: "av1".into()
            }
        );
    }

    #[tokio::test]
    async fn zero_total_cap_never_admits() {
        let mut caps = gpu_caps(3);
        caps.max_concurrent_jobs = 0;
        let controller = AdmissionController::new(caps, Duration::from_secs(1));
        let err = controller
            .admit(&hw_job(GpuExhaustedPolicy::Fallback))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::CapacityExhausted);
    }

    #[tokio::test]
    async fn passthrough_consumes_a_cpu_slot_only() {
        let controller = AdmissionController::new(gpu_caps(3), Duration::from_secs(1));
        let spec = JobSpec {
            target_video_codec: "copy".into(),
            target_audio_codec: "copy".into(),
            ..Default::default()
        };
        let admission = controller.admit(&spec).await.unwrap();
        assert_eq!(admission.video_encoder, None);
        assert_eq!(admission.audio_encoder, None);
        assert_eq!(admission.ticket.class(), SlotClass::Cpu);
        assert_eq!(controller.gpu_utilization()[0].active_encode_sessions, 0);
    }

    #[tokio::test]
    async fn lowering_caps_never_revokes_held_slots() {
        let controller = AdmissionController::new(gpu_caps(3), Duration::from_secs(1));
        let held: Vec<_> = vec![
            controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await.unwrap(),
            controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await.unwrap(),
        ];

        controller
            .update_caps(&ConcurrencyUpdate {
                max_concurrent_jobs: Some(1),
                ..Default::default()
            })
            .await;

        // Both jobs keep running; releasing one pays the debt, so capacity
        // stays exhausted until the second also finishes.
        drop(held);
        let admission = controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await;
        assert!(admission.is_ok());
        let err = controller
            .admit(&hw_job(GpuExhaustedPolicy::Reject))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::CapacityExhausted);
    }

    #[tokio::test]
    async fn probe_slots_are_their_own_class() {
        let controller = AdmissionController::new(gpu_caps(3), Duration::from_secs(1));
        let _a = controller.admit_probe().await.unwrap();
        let _b = controller.admit_probe().await.unwrap();
        let err = controller.admit_probe().await.unwrap_err();
        assert_eq!(err, AdmissionError::CapacityExhausted);
    }

    #[test]
    fn slot_accounting_never_exceeds_caps() {
        use proptest::prelude::*;

        proptest!(|(ops in proptest::collection::vec(0u8..3, 1..40))| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            rt.block_on(async {
                let caps = gpu_caps(2);
                let total_cap = caps.max_concurrent_jobs;
                let session_cap = 2;
                let controller = AdmissionController::new(caps, Duration::from_millis(1));
                let mut held: Vec<Admission> = Vec::new();
                for op in ops {
                    match op {
                        0 => {
                            if let Ok(a) =
                                controller.admit(&hw_job(GpuExhaustedPolicy::Reject)).await
                            {
                                held.push(a);
                            }
                        }
                        1 => {
                            let spec = JobSpec {
                                source_video_codec: "h264".into(),
                                source_audio_codec: "aac".into(),
                                target_video_codec: "h264".into(),
                                target_audio_codec: "aac".into(),
                                ..Default::default()
                            };
                            if let Ok(a) = controller.admit(&spec).await {
                                held.push(a);
                            }
                        }
                        _ => {
                            if !held.is_empty() {
                                held.remove(0);
                            }
                        }
                    }
                    let sessions = controller.gpu_utilization()[0].active_encode_sessions;
                    prop_assert!(sessions <= session_cap);
                    prop_assert!(held.len() as u32 <= total_cap);
                }
                Ok(())
            }).unwrap();
        });
    }
}
