//! dBFT Consensus Service
//!
//! A long-running service that owns a [`Dbft`] engine and serializes every
//! event it reacts to:
//!
//! 1. Timer firings from the engine's timer.
//! 2. Consensus payloads received from the network.
//! 3. Transactions arriving in the pool.
//!
//! After each event, if the engine accepted a block, the service moves it on
//! to the next height.

use {
    crate::{
        engine::Dbft,
        error::Error,
        host::Host,
        message::ConsensusPayload,
        timer::Timer,
        types::{Block, HeightView},
    },
    crossbeam_channel::{select, Receiver},
    log::*,
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

/// How often the loop wakes up to check the exit flag when idle.
const EXIT_POLL_INTERVAL_MS: u64 = 50;

/// Input channels of the consensus loop.
pub struct ServiceChannels<H, T> {
    pub timer_receiver: Receiver<HeightView>,
    pub payload_receiver: Receiver<ConsensusPayload<H>>,
    pub transaction_receiver: Receiver<T>,
}

/// Runs the consensus event loop on a dedicated thread.
pub struct ConsensusService {
    thread: JoinHandle<Result<(), Error>>,
}

impl ConsensusService {
    /// Starts the engine at `start_timestamp` (timestamp of the last
    /// accepted block, in milliseconds) and spawns the event loop. The loop
    /// ends when `exit` is set, an input channel disconnects or the engine
    /// returns a fatal error.
    pub fn new<A, T>(
        mut engine: Dbft<A, T>,
        start_timestamp: u64,
        channels: ServiceChannels<A::Hash, A::Transaction>,
        exit: Arc<AtomicBool>,
    ) -> io::Result<Self>
    where
        A: Host + 'static,
        A::Transaction: Send,
        T: Timer + 'static,
        Dbft<A, T>: Send,
    {
        let thread = Builder::new()
            .name("dbftConsensus".to_string())
            .spawn(move || Self::run(&mut engine, start_timestamp, &channels, &exit))?;
        Ok(Self { thread })
    }

    /// Join the consensus service thread.
    pub fn join(self) -> thread::Result<Result<(), Error>> {
        self.thread.join()
    }

    fn run<A: Host, T: Timer>(
        engine: &mut Dbft<A, T>,
        start_timestamp: u64,
        channels: &ServiceChannels<A::Hash, A::Transaction>,
        exit: &AtomicBool,
    ) -> Result<(), Error> {
        info!("ConsensusService: starting after block timestamp {start_timestamp}");
        engine.start(start_timestamp)?;
        Self::advance_if_accepted(engine)?;

        let poll_interval = Duration::from_millis(EXIT_POLL_INTERVAL_MS);
        loop {
            if exit.load(Ordering::Relaxed) {
                info!("ConsensusService: exit signal received, shutting down");
                return Ok(());
            }

            select! {
                recv(channels.timer_receiver) -> hv => match hv {
                    Ok(hv) => engine.on_timeout(hv)?,
                    Err(_) => {
                        info!("ConsensusService: timer disconnected, shutting down");
                        return Ok(());
                    }
                },
                recv(channels.payload_receiver) -> payload => match payload {
                    Ok(payload) => engine.on_receive(payload)?,
                    Err(_) => {
                        info!("ConsensusService: network disconnected, shutting down");
                        return Ok(());
                    }
                },
                recv(channels.transaction_receiver) -> tx => match tx {
                    Ok(tx) => engine.on_transaction(tx)?,
                    Err(_) => {
                        info!("ConsensusService: transaction pool disconnected, shutting down");
                        return Ok(());
                    }
                },
                default(poll_interval) => {}
            }

            Self::advance_if_accepted(engine)?;
        }
    }

    fn advance_if_accepted<A: Host, T: Timer>(engine: &mut Dbft<A, T>) -> Result<(), Error> {
        if !engine.context().block_sent() {
            return Ok(());
        }
        let Some(timestamp) = engine.block().map(|block| block.timestamp()) else {
            return Ok(());
        };
        debug!(
            "ConsensusService: block accepted at height {}, moving on",
            engine.context().block_index
        );
        engine.reset(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::DbftConfig,
            testing::{TestBlock, TestHost, TestTransaction},
            timer::ChannelTimer,
        },
        assert_matches::assert_matches,
        crossbeam_channel::{bounded, unbounded, Sender},
        solana_hash::Hash,
        solana_keypair::Keypair,
        solana_signer::Signer,
    };

    const WAIT: Duration = Duration::from_secs(10);

    struct TestService {
        service: ConsensusService,
        blocks: Receiver<TestBlock>,
        exit: Arc<AtomicBool>,
        _payload_sender: Sender<ConsensusPayload<Hash>>,
        _transaction_sender: Sender<TestTransaction>,
    }

    fn make_single_validator_service(fail_process_block: bool) -> TestService {
        let keypair = Arc::new(Keypair::new());
        let mut host = TestHost::new(vec![keypair.pubkey()], Some(keypair));
        let (block_sender, blocks) = unbounded();
        host.block_notifier = Some(block_sender);
        host.fail_process_block = fail_process_block;

        let timer = ChannelTimer::new().unwrap();
        let timer_receiver = timer.fired();
        let config = DbftConfig {
            time_per_block: Duration::from_millis(20),
            ..DbftConfig::default()
        };
        let engine = Dbft::builder(config, host, timer).build().unwrap();

        let (payload_sender, payload_receiver) = bounded(1);
        let (transaction_sender, transaction_receiver) = bounded(1);
        let exit = Arc::new(AtomicBool::new(false));
        let service = ConsensusService::new(
            engine,
            0,
            ServiceChannels {
                timer_receiver,
                payload_receiver,
                transaction_receiver,
            },
            exit.clone(),
        )
        .unwrap();
        TestService {
            service,
            blocks,
            exit,
            _payload_sender: payload_sender,
            _transaction_sender: transaction_sender,
        }
    }

    #[test]
    fn test_service_produces_consecutive_blocks() {
        let test = make_single_validator_service(false);
        for height in 1..=3 {
            let block = test.blocks.recv_timeout(WAIT).unwrap();
            assert_eq!(block.index, height);
        }
        test.exit.store(true, Ordering::Relaxed);
        assert_matches!(test.service.join(), Ok(Ok(())));
    }

    #[test]
    fn test_service_stops_on_block_processing_failure() {
        let test = make_single_validator_service(true);
        assert_matches!(
            test.service.join(),
            Ok(Err(Error::BlockProcessing { height: 1, .. }))
        );
        assert!(test.blocks.try_recv().is_err());
    }
}
