//! Receive queues.

mod translator;

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::DatapathConfig;
use crate::device::{MappingRequirement, NetDevice, QueueSetup, RxCapabilities};
use crate::errors::Result;
use crate::exec::{EcState, EcWorker, ExecutionContext};
use crate::nbl::NblChain;
use crate::os::OsNetStack;
use crate::pool::{DmaLimits, PoolConfig, PoolDispatch, PoolHandle, create_pool};
use crate::queue_control::{ControlledQueue, QueueState, QueueStatus, StatusBoard};
use crate::ring::RingCollection;
use crate::stats::{QueueStat, QueueStats};

pub(crate) use translator::rx_extensions;
use translator::RxTranslator;

pub(crate) struct RxReturns {
    /// Lists indicated and not yet returned.
    pub(crate) outstanding: usize,
    pub(crate) armed: bool,
}

pub(crate) struct RxQueueShared {
    pub(crate) returns: Mutex<RxReturns>,
    pub(crate) returned: Condvar,
    pub(crate) status: QueueStatus,
    pub(crate) stats: QueueStats,
}

pub struct RxQueue {
    queue_id: u32,
    shared: Arc<RxQueueShared>,
    ec: ExecutionContext,
    pool: PoolHandle,
    dispatch: PoolDispatch,
}

impl RxQueue {
    pub(crate) fn create(
        queue_id: u32,
        device: &Arc<dyn NetDevice>,
        stack: &Arc<dyn OsNetStack>,
        capabilities: &RxCapabilities,
        config: &DatapathConfig,
        board: Arc<StatusBoard>,
    ) -> Result<Self> {
        let registry = rx_extensions(capabilities)?;
        let rings = RingCollection::new(
            DatapathConfig::ring_size(config.rx_ring.packet_count, capabilities.packet_ring_size),
            DatapathConfig::ring_size(
                config.rx_ring.fragment_count,
                capabilities.fragment_ring_size,
            ),
            &registry,
        )?;
        let dma = (capabilities.mapping_requirement == MappingRequirement::DmaMapped).then(|| {
            DmaLimits {
                max_logical_address: capabilities.max_physical_address,
                max_chunk_size: PoolConfig::default().max_chunk_size,
            }
        });
        let (pool, dispatch) = create_pool(&PoolConfig {
            buffer_count: config.rx.buffer_count,
            buffer_size: config.rx.buffer_size.unwrap_or(capabilities.buffer_size),
            alignment: capabilities.buffer_alignment,
            dma,
            ..Default::default()
        })?;

        let shared = Arc::new(RxQueueShared {
            returns: Mutex::new(RxReturns {
                outstanding: 0,
                armed: false,
            }),
            returned: Condvar::new(),
            status: QueueStatus::new(board),
            stats: QueueStats::default(),
        });

        let slot: Arc<Mutex<Option<RxTranslator>>> = Arc::new(Mutex::new(None));
        let ec = {
            let slot = slot.clone();
            ExecutionContext::initialize(format!("rx{queue_id}"), move |worker: EcWorker| {
                let started = worker.wait_for_start();
                let translator = slot.lock().take();
                if let Some(translator) = translator {
                    translator.run(worker, started);
                }
            })?
        };
        let device_queue = device.create_rx_queue(QueueSetup {
            queue_id,
            notifier: ec.notifier(),
        })?;
        let translator = RxTranslator::new(
            queue_id,
            shared.clone(),
            device_queue,
            stack.clone(),
            rings,
            capabilities,
            pool.clone(),
        )?;
        *slot.lock() = Some(translator);
        debug!("rx{queue_id}: created with {} buffers", pool.capacity());

        Ok(Self {
            queue_id,
            shared,
            ec,
            pool,
            dispatch,
        })
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Takes back lists this queue indicated, releasing their buffers.
    pub fn return_lists(&self, chain: NblChain) {
        let count = chain.len();
        drop(chain);
        let armed = {
            let mut returns = self.shared.returns.lock();
            if count > returns.outstanding {
                warn!(
                    "rx{}: {count} lists returned, {} outstanding",
                    self.queue_id, returns.outstanding
                );
            }
            returns.outstanding = returns.outstanding.saturating_sub(count);
            std::mem::take(&mut returns.armed)
        };
        self.shared.returned.notify_all();
        if armed {
            self.ec.signal();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.shared.returns.lock().outstanding
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    pub fn stats(&self) -> QueueStat {
        self.shared.stats.snapshot()
    }
}

impl ControlledQueue for RxQueue {
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
        self.ec.cancel();
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        if self.ec.state() == EcState::Started {
            self.ec.cancel();
        }
        self.ec.terminate();
        (self.dispatch.destroy)(self.pool.clone());
    }
}
