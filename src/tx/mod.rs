//! Transmit queues.
//!
//! The stack appends chains to a queue's shared FIFO from any thread; the
//! queue's worker pulls them, translates them onto the rings and completes
//! them once the device hands their packets back.

mod scaling;
mod translator;

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::DatapathConfig;
use crate::device::{MappingRequirement, NetDevice, QueueSetup, TxCapabilities};
use crate::dma::BounceBufferPool;
use crate::errors::{Error, Result};
use crate::exec::{EcState, EcWorker, ExecutionContext};
use crate::nbl::{CompletionStatus, ExecutionLevel, NblChain};
use crate::os::OsNetStack;
use crate::pool::{DmaLimits, PoolConfig, PoolDispatch, PoolHandle, create_pool};
use crate::queue_control::{ControlledQueue, QueueControl, QueueState, QueueStatus, StatusBoard};
use crate::ring::RingCollection;
use crate::stats::{QueueStat, QueueStats};

pub use scaling::{Demux, PeerAddressDemux, TxScaling, UserPriorityDemux, WmmDemux};

pub(crate) use translator::tx_extensions;
use translator::TxTranslator;

pub(crate) struct TxFifo {
    pub(crate) chain: NblChain,
    /// The worker sleeps and wants a signal on the next send.
    pub(crate) armed: bool,
    pub(crate) accepting: bool,
}

pub(crate) struct TxQueueShared {
    pub(crate) fifo: Mutex<TxFifo>,
    pub(crate) status: QueueStatus,
    pub(crate) stats: QueueStats,
}

/// What every transmit queue of a datapath is built from.
#[derive(Clone)]
pub(crate) struct TxEnvironment {
    pub(crate) device: Arc<dyn NetDevice>,
    pub(crate) stack: Arc<dyn OsNetStack>,
    pub(crate) capabilities: TxCapabilities,
    pub(crate) config: DatapathConfig,
    pub(crate) board: Arc<StatusBoard>,
}

pub struct TxQueue {
    queue_id: u32,
    shared: Arc<TxQueueShared>,
    ec: ExecutionContext,
    bounce_pool: Option<(PoolHandle, PoolDispatch)>,
}

impl TxQueue {
    pub(crate) fn create(queue_id: u32, environment: &TxEnvironment) -> Result<Self> {
        let capabilities = &environment.capabilities;
        let config = &environment.config;
        let registry = tx_extensions(capabilities)?;
        let rings = RingCollection::new(
            DatapathConfig::ring_size(config.tx_ring.packet_count, capabilities.packet_ring_size),
            DatapathConfig::ring_size(
                config.tx_ring.fragment_count,
                capabilities.fragment_ring_size,
            ),
            &registry,
        )?;

        let bounce_pool = if config.bounce.enabled {
            let dma = (capabilities.mapping_requirement == MappingRequirement::DmaMapped).then(|| {
                DmaLimits {
                    max_logical_address: capabilities.max_physical_address,
                    max_chunk_size: PoolConfig::default().max_chunk_size,
                }
            });
            Some(create_pool(&PoolConfig {
                buffer_count: config.bounce.buffer_count,
                buffer_size: config.bounce.buffer_size,
                dma,
                ..Default::default()
            })?)
        } else {
            None
        };

        let shared = Arc::new(TxQueueShared {
            fifo: Mutex::new(TxFifo {
                chain: NblChain::new(),
                armed: false,
                accepting: true,
            }),
            status: QueueStatus::new(environment.board.clone()),
            stats: QueueStats::default(),
        });

        let slot: Arc<Mutex<Option<TxTranslator>>> = Arc::new(Mutex::new(None));
        let ec = {
            let slot = slot.clone();
            ExecutionContext::initialize(format!("tx{queue_id}"), move |worker: EcWorker| {
                let started = worker.wait_for_start();
                let translator = slot.lock().take();
                if let Some(translator) = translator {
                    translator.run(worker, started);
                }
            })?
        };
        let device_queue = environment.device.create_tx_queue(QueueSetup {
            queue_id,
            notifier: ec.notifier(),
        })?;
        let translator = TxTranslator::new(
            queue_id,
            shared.clone(),
            device_queue,
            environment.stack.clone(),
            rings,
            capabilities.clone(),
            bounce_pool
                .as_ref()
                .map(|(pool, _)| BounceBufferPool::new(pool.clone())),
        )?;
        *slot.lock() = Some(translator);
        debug!("tx{queue_id}: created");

        Ok(Self {
            queue_id,
            shared,
            ec,
            bounce_pool,
        })
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Queues `chain` for transmission, or hands it back if the queue no
    /// longer accepts work.
    pub fn send(&self, mut chain: NblChain) -> std::result::Result<(), NblChain> {
        let armed = {
            let mut fifo = self.shared.fifo.lock();
            if !fifo.accepting {
                return Err(chain);
            }
            fifo.chain.append(&mut chain);
            std::mem::take(&mut fifo.armed)
        };
        if armed {
            self.ec.signal();
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStat {
        self.shared.stats.snapshot()
    }

    /// The pool packets are copied into when they cannot be mapped as they
    /// are.
    pub fn bounce_pool(&self) -> Option<&PoolHandle> {
        self.bounce_pool.as_ref().map(|(pool, _)| pool)
    }
}

impl ControlledQueue for TxQueue {
    fn status(&self) -> &QueueStatus {
        &self.shared.status
    }

    fn start(&self) {
        if self.ec.state() == EcState::Stopped {
            self.ec.start();
        }
    }

    fn request_stop(&self) {
        if self.ec.state() != EcState::Started {
            return;
        }
        self.shared.status.set(QueueState::Stopping);
        self.shared.fifo.lock().accepting = false;
        self.ec.cancel();
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        if self.ec.state() == EcState::Started {
            self.ec.cancel();
        }
        self.ec.terminate();
        if let Some((pool, dispatch)) = self.bounce_pool.take() {
            (dispatch.destroy)(pool);
        }
    }
}

/// The transmit queues of one datapath, created on first use.
pub(crate) struct TxQueueSet {
    scaling: TxScaling,
    environment: TxEnvironment,
    queues: Mutex<Vec<Option<Arc<TxQueue>>>>,
}

impl TxQueueSet {
    pub(crate) fn new(environment: TxEnvironment) -> Result<Self> {
        let scaling = TxScaling::from_config(&environment.config.tx_scaling);
        let count = scaling.queue_count();
        if count > environment.capabilities.max_queues {
            return Err(Error::NotSupported(
                "transmit scaling needs more queues than the device has",
            ));
        }
        Ok(Self {
            scaling,
            environment,
            queues: Mutex::new((0..count).map(|_| None).collect()),
        })
    }

    /// Queues created so far.
    pub(crate) fn active_queues(&self) -> usize {
        self.queues.lock().iter().flatten().count()
    }

    pub(crate) fn get(&self, index: u32) -> Option<Arc<TxQueue>> {
        self.queues.lock().get(index as usize)?.clone()
    }

    fn queue(&self, index: u32, control: &QueueControl) -> Result<Arc<TxQueue>> {
        let mut queues = self.queues.lock();
        if let Some(queue) = &queues[index as usize] {
            return Ok(queue.clone());
        }
        let queue = Arc::new(TxQueue::create(index, &self.environment)?);
        control.register(queue.clone());
        queues[index as usize] = Some(queue.clone());
        Ok(queue)
    }

    /// Routes every list to its queue. Lists that cannot be queued are
    /// completed right away.
    pub(crate) fn send(&self, chain: NblChain, control: &QueueControl) {
        let mut rejected = NblChain::new();
        let mut routed: Vec<NblChain> = (0..self.scaling.queue_count())
            .map(|_| NblChain::new())
            .collect();
        for mut list in chain {
            match self.scaling.queue_for(&list) {
                Some(index) => routed[index as usize].push_back(list),
                None => {
                    list.status = CompletionStatus::InvalidPacket;
                    rejected.push_back(list);
                }
            }
        }

        for (index, mut lists) in routed.into_iter().enumerate() {
            if lists.is_empty() {
                continue;
            }
            match self.queue(index as u32, control) {
                Ok(queue) => {
                    if let Err(mut lists) = queue.send(lists) {
                        lists.set_status(CompletionStatus::Paused);
                        rejected.append(&mut lists);
                    }
                }
                Err(err) => {
                    warn!("tx{index}: queue creation failed: {err}");
                    lists.set_status(CompletionStatus::Resources);
                    rejected.append(&mut lists);
                }
            }
        }

        if !rejected.is_empty() {
            self.environment
                .stack
                .complete_send(rejected, ExecutionLevel::Dispatch);
        }
    }

    pub(crate) fn stats(&self) -> QueueStat {
        let mut total = QueueStat::default();
        for queue in self.queues.lock().iter().flatten() {
            total += queue.stats();
        }
        total
    }
}
