//! Long-running background loops: the ingest queue drain and the classification sweep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobmon_ai::{AiClient, ClassificationPolicy};
use jobmon_core::{Classification, NewLead};
use jobmon_storage::{LeadStore, SaveOutcome, StorageError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::notify::LeadNotifier;

/// Producer half of the ingest FIFO. Cheap to clone; one per request handler.
#[derive(Debug, Clone)]
pub struct IngestQueue {
    tx: mpsc::UnboundedSender<NewLead>,
    depth: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct IngestReceiver {
    rx: mpsc::UnboundedReceiver<NewLead>,
    depth: Arc<AtomicUsize>,
}

pub fn ingest_queue() -> (IngestQueue, IngestReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        IngestQueue {
            tx,
            depth: depth.clone(),
        },
        IngestReceiver { rx, depth },
    )
}

impl IngestQueue {
    /// Returns `false` if the worker has shut down and the lead was dropped.
    pub fn enqueue(&self, lead: NewLead) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(lead).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Leads accepted but not yet taken by the worker.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl IngestReceiver {
    pub async fn recv(&mut self) -> Option<NewLead> {
        let lead = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(lead)
    }
}

/// Drain the queue into the save pipeline, pausing `throttle` after each lead.
/// Returns once every [`IngestQueue`] handle is dropped, with the number of leads handled.
pub async fn run_ingest_worker(mut receiver: IngestReceiver, leads: LeadStore, throttle: Duration) -> usize {
    info!(throttle_ms = throttle.as_millis() as u64, "ingest worker started");
    let mut handled = 0;
    while let Some(lead) = receiver.recv().await {
        match leads.try_save_lead(&lead).await {
            Ok(SaveOutcome::Inserted) => {
                info!(source = %lead.source, external_id = %lead.external_id, "ingested lead saved")
            }
            Ok(SaveOutcome::Duplicate) => {
                debug!(source = %lead.source, external_id = %lead.external_id, "ingested lead already known")
            }
            Err(err) => error!(
                source = %lead.source,
                external_id = %lead.external_id,
                error = %err,
                "saving ingested lead failed"
            ),
        }
        handled += 1;
        tokio::time::sleep(throttle).await;
    }
    info!(handled, "ingest worker stopped");
    handled
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// No credentials; pending leads are left untouched.
    Disabled,
    Idle,
    /// The model could not be reached; the lead stays pending for a later sweep.
    Deferred { id: String },
    Classified {
        id: String,
        classification: Classification,
    },
}

pub struct ClassificationWorker {
    leads: LeadStore,
    ai: AiClient,
    policy: Arc<ClassificationPolicy>,
    notifier: Option<Arc<dyn LeadNotifier>>,
    busy_pause: Duration,
    idle_pause: Duration,
}

impl ClassificationWorker {
    pub fn new(leads: LeadStore, ai: AiClient, policy: Arc<ClassificationPolicy>) -> Self {
        Self {
            leads,
            ai,
            policy,
            notifier: None,
            busy_pause: Duration::from_secs(1),
            idle_pause: Duration::from_secs(5),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn LeadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_pauses(mut self, busy: Duration, idle: Duration) -> Self {
        self.busy_pause = busy;
        self.idle_pause = idle;
        self
    }

    /// Classify at most one pending lead and persist the result.
    pub async fn sweep_once(&self) -> Result<SweepOutcome, StorageError> {
        if !self.ai.is_configured() {
            return Ok(SweepOutcome::Disabled);
        }
        let Some(lead) = self.leads.next_unscored().await? else {
            return Ok(SweepOutcome::Idle);
        };

        let classification = match self.policy.try_classify(&self.ai, &lead.title, &lead.description).await {
            Ok(classification) => classification,
            Err(err) => {
                warn!(id = %lead.id, error = %err, "classification deferred");
                return Ok(SweepOutcome::Deferred { id: lead.id });
            }
        };
        self.leads.record_classification(&lead.id, &classification).await?;
        info!(
            id = %lead.id,
            agency = %classification.label,
            score = classification.score,
            confidence = classification.confidence,
            "lead classified"
        );

        if let (Some(notifier), Some(key)) = (&self.notifier, classification.label.agency_key()) {
            let color = self.policy.profile(key).and_then(|p| p.color);
            notifier.notify(&lead, &classification, color).await;
        }

        Ok(SweepOutcome::Classified {
            id: lead.id,
            classification,
        })
    }

    /// Sweep forever. Failures are logged and followed by the idle pause.
    pub async fn run(self) {
        if !self.ai.is_configured() {
            warn!("no AI credentials configured; classification sweep idle");
        }
        info!(
            busy_ms = self.busy_pause.as_millis() as u64,
            idle_ms = self.idle_pause.as_millis() as u64,
            "classification worker started"
        );
        loop {
            let pause = match self.sweep_once().await {
                Ok(SweepOutcome::Classified { .. }) => self.busy_pause,
                Ok(SweepOutcome::Idle | SweepOutcome::Disabled | SweepOutcome::Deferred { .. }) => self.idle_pause,
                Err(err) => {
                    error!(error = %err, "classification sweep failed");
                    self.idle_pause
                }
            };
            tokio::time::sleep(pause).await;
        }
    }
}
