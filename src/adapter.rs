//! The adapter's datapath: every queue of one device, brought up and down
//! together.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::DatapathConfig;
use crate::device::NetDevice;
use crate::errors::{Error, Result};
use crate::nbl::{CompletionStatus, ExecutionLevel, NblChain};
use crate::os::OsNetStack;
use crate::queue_control::QueueControl;
use crate::rx::RxQueue;
use crate::stats::Stat;
use crate::tx::{TxEnvironment, TxQueue, TxQueueSet};

struct Datapath {
    control: QueueControl,
    rx_queues: Vec<Arc<RxQueue>>,
    tx: TxQueueSet,
}

impl Datapath {
    fn stats(&self) -> Stat {
        let mut stat = Stat {
            tx: self.tx.stats(),
            ..Default::default()
        };
        for queue in &self.rx_queues {
            stat.rx += queue.stats();
        }
        stat
    }
}

#[derive(Default)]
struct AdapterState {
    datapath: Option<Arc<Datapath>>,
    running: bool,
    /// Queue contexts run once; a datapath that ran is rebuilt to restart.
    ran: bool,
}

pub struct Adapter {
    config: DatapathConfig,
    device: Arc<dyn NetDevice>,
    stack: Arc<dyn OsNetStack>,
    /// Serializes create, start, stop and destroy.
    serial: Mutex<()>,
    state: RwLock<AdapterState>,
    /// Receive queues by id. Stop waits on returns, so returns never touch
    /// `state`.
    rx_routes: RwLock<Vec<Arc<RxQueue>>>,
    /// Counters of datapaths already torn down.
    retired: Mutex<Stat>,
}

impl Adapter {
    pub fn new(
        config: DatapathConfig,
        device: Arc<dyn NetDevice>,
        stack: Arc<dyn OsNetStack>,
    ) -> Self {
        Self {
            config,
            device,
            stack,
            serial: Mutex::new(()),
            state: RwLock::new(AdapterState::default()),
            rx_routes: RwLock::new(Vec::new()),
            retired: Mutex::new(Stat::default()),
        }
    }

    /// Builds every queue without starting any.
    pub fn create_datapath(&self) -> Result<()> {
        let _serial = self.serial.lock();
        if self.state.read().datapath.is_some() {
            return Err(Error::InvalidState("datapath already created"));
        }
        self.build()
    }

    fn build(&self) -> Result<()> {
        let capabilities = self.device.capabilities();
        let rx_count = self
            .config
            .rx_queue_count
            .unwrap_or(capabilities.rx.max_queues)
            .min(capabilities.rx.max_queues);
        let control = QueueControl::new("nicxlat")?;
        let board = control.board();

        let tx = TxQueueSet::new(TxEnvironment {
            device: self.device.clone(),
            stack: self.stack.clone(),
            capabilities: capabilities.tx.clone(),
            config: self.config.clone(),
            board: board.clone(),
        })?;

        let mut rx_queues = Vec::with_capacity(rx_count as usize);
        for queue_id in 0..rx_count {
            let queue = Arc::new(RxQueue::create(
                queue_id,
                &self.device,
                &self.stack,
                &capabilities.rx,
                &self.config,
                board.clone(),
            )?);
            control.register(queue.clone());
            rx_queues.push(queue);
        }

        *self.rx_routes.write() = rx_queues.clone();
        self.state.write().datapath = Some(Arc::new(Datapath {
            control,
            rx_queues,
            tx,
        }));
        info!("datapath created with {rx_count} receive queues");
        Ok(())
    }

    /// Starts every queue, creating the datapath first if needed. Blocks
    /// until all queues run.
    pub fn start_datapath(&self) -> Result<()> {
        let _serial = self.serial.lock();
        let stale = {
            let mut state = self.state.write();
            if state.running {
                return Ok(());
            }
            if state.ran {
                state.ran = false;
                state.datapath.take()
            } else {
                None
            }
        };
        if let Some(stale) = stale {
            debug!("rebuilding datapath for restart");
            self.retire(stale);
        }
        if self.state.read().datapath.is_none() {
            self.build()?;
        }

        let datapath = self
            .state
            .read()
            .datapath
            .clone()
            .ok_or(Error::InvalidState("no datapath"))?;
        datapath.control.synchronize_datapath_start();

        let mut state = self.state.write();
        state.running = true;
        state.ran = true;
        info!("datapath started");
        Ok(())
    }

    /// Stops every queue. Blocks until transmit work is aborted and every
    /// received list has been returned.
    pub fn stop_datapath(&self) {
        let _serial = self.serial.lock();
        self.stop();
    }

    fn stop(&self) {
        let datapath = {
            let mut state = self.state.write();
            if !state.running {
                return;
            }
            state.running = false;
            state.datapath.clone()
        };
        if let Some(datapath) = datapath {
            datapath.control.synchronize_datapath_stop();
            info!("datapath stopped");
        }
    }

    /// Stops the datapath if running and releases every queue.
    pub fn destroy_datapath(&self) {
        let _serial = self.serial.lock();
        self.stop();
        let datapath = {
            let mut state = self.state.write();
            state.ran = false;
            state.datapath.take()
        };
        if let Some(datapath) = datapath {
            self.retire(datapath);
            info!("datapath destroyed");
        }
    }

    fn retire(&self, datapath: Arc<Datapath>) {
        self.rx_routes.write().clear();
        let stat = datapath.stats();
        {
            let mut retired = self.retired.lock();
            retired.tx += stat.tx;
            retired.rx += stat.rx;
        }
        drop(datapath);
    }

    pub fn is_running(&self) -> bool {
        self.state.read_recursive().running
    }

    /// Transmits `chain`. Lists are completed with `Paused` while the
    /// datapath is not running.
    pub fn send_net_buffer_lists(&self, mut chain: NblChain) {
        if chain.is_empty() {
            return;
        }
        let datapath = {
            let state = self.state.read_recursive();
            if state.running {
                state.datapath.clone()
            } else {
                None
            }
        };
        match datapath {
            Some(datapath) => datapath.tx.send(chain, &datapath.control),
            None => {
                debug!("send while paused: completing {} lists", chain.len());
                chain.set_status(CompletionStatus::Paused);
                self.stack.complete_send(chain, ExecutionLevel::Dispatch);
            }
        }
    }

    /// Gives received lists back to the queues that indicated them.
    pub fn return_net_buffer_lists(&self, chain: NblChain) {
        let routes = self.rx_routes.read();
        let mut returns: Vec<NblChain> = (0..routes.len()).map(|_| NblChain::new()).collect();
        let mut stray = 0;
        for list in chain {
            match list.source_queue.map(|id| id as usize) {
                Some(id) if id < routes.len() => returns[id].push_back(list),
                _ => stray += 1,
            }
        }
        if stray > 0 {
            warn!("{stray} returned lists belong to no receive queue");
        }
        for (queue, lists) in routes.iter().zip(returns) {
            if !lists.is_empty() {
                queue.return_lists(lists);
            }
        }
    }

    /// Transmit queues created so far.
    pub fn active_tx_queues(&self) -> usize {
        self.state
            .read_recursive()
            .datapath
            .as_ref()
            .map_or(0, |datapath| datapath.tx.active_queues())
    }

    /// Transmit queue `index`, if traffic has created it.
    pub fn tx_queue(&self, index: u32) -> Option<Arc<TxQueue>> {
        self.state
            .read_recursive()
            .datapath
            .as_ref()
            .and_then(|datapath| datapath.tx.get(index))
    }

    pub fn statistics(&self) -> Stat {
        let mut stat = *self.retired.lock();
        let datapath = self.state.read_recursive().datapath.clone();
        if let Some(datapath) = datapath {
            let current = datapath.stats();
            stat.tx += current.tx;
            stat.rx += current.rx;
        }
        stat
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.destroy_datapath();
    }
}
