//! The ForgeChain node
//!
//! A [`Node`] owns all mutable chain state ([`ChainInfo`]) and is driven by a
//! single loop: peer messages, worker results, the warm-up timer, the mining
//! tick and the resync tick are handled one at a time, each to completion.
//! Nothing in here is shared, so nothing is locked.

use crate::blockchain::{verify_block, Block};
use crate::config::Config;
use crate::consensus::StakeRegistry;
use crate::crypto::KeyPair;
use crate::error::{ChainError, Result};
use crate::mempool::Mempool;
use crate::miner::{build_reward, select_transactions, Miner, MiningResult};
use crate::network::{
    self, BlockRequest, Identity, Message, NetworkEvent, PeerAuth, Peers, PoolRequest,
};
use crate::persistence::{BlockStore, Ledger, Store};
use crate::sync::{CatchUp, SyncQueue, SyncState};
use crate::transaction::{Transaction, TransactionData, MINT_ADDRESS};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CHECKED_BLOCKS_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4_096) {
    Some(capacity) => capacity,
    None => panic!("capacity must be non-zero"),
};

/// Process-local chain state. Its parts are persisted individually; this
/// struct itself never is.
pub struct ChainInfo {
    pub latest_block: Block,
    pub mempool: Mempool,
    pub checked_block_hashes: LruCache<String, ()>,
    pub sync_queue: SyncQueue,
    pub stake_registry: StakeRegistry,
    pub catch_up: CatchUp,
}

/// Receiving ends of the node's event sources.
pub struct NodeChannels {
    pub network: mpsc::UnboundedReceiver<NetworkEvent>,
    pub mined: mpsc::UnboundedReceiver<MiningResult>,
}

/// Stores genesis, the mint account, the reward account and the genesis
/// validators' accounts and stakes. Does nothing if a chain already exists.
pub fn bootstrap_genesis(store: Arc<dyn Store>, config: &Config, reward_address: &str) -> Result<()> {
    let blocks = BlockStore::new(store.clone());
    if blocks.highest_number()?.is_some() {
        return Ok(());
    }

    let ledger = Ledger::new(store.clone());
    blocks.put_block(&Block::genesis())?;
    ledger.ensure_account(MINT_ADDRESS, config.genesis.initial_supply)?;
    ledger.ensure_account(reward_address, 0)?;

    let mut stakes = StakeRegistry::new(store);
    stakes.initialize()?;
    for validator in &config.genesis.validators {
        ledger.ensure_account(&validator.public_key, 0)?;
        if stakes.get(&validator.public_key).is_none() {
            stakes.update(&validator.public_key, validator.stake)?;
        }
    }

    info!(
        supply = config.genesis.initial_supply,
        validators = config.genesis.validators.len(),
        "genesis bootstrapped"
    );
    Ok(())
}

pub struct Node {
    config: Config,
    keypair: KeyPair,
    identity: Identity,
    reward_address: String,
    ledger: Ledger,
    blocks: BlockStore,
    chain: ChainInfo,
    peers: Peers,
    /// public key -> peer address, from the allow-list
    peer_keys: HashMap<String, String>,
    miner: Miner,
    network_tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl Node {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<(Node, NodeChannels)> {
        let keypair = match config.miner.keypair()? {
            Some(keypair) => keypair,
            None => {
                let keypair = KeyPair::generate();
                warn!(address = %keypair.address(), "no miner.secret_key_hex configured, using a throwaway key");
                keypair
            }
        };
        let identity = Identity::new(config.network.advertised_address(), &keypair)?;
        let reward_address = config
            .miner
            .reward_address
            .clone()
            .unwrap_or_else(|| keypair.address());

        bootstrap_genesis(store.clone(), &config, &reward_address)?;

        let blocks = BlockStore::new(store.clone());
        let ledger = Ledger::new(store.clone());
        let latest_block = blocks
            .latest_block()?
            .ok_or_else(|| ChainError::DatabaseError("no blocks after bootstrap".to_string()))?;

        let mut stake_registry = StakeRegistry::new(store);
        stake_registry.initialize()?;

        let catch_up = CatchUp::new(config.sync.catch_up, Some(latest_block.number));
        let peer_keys = config
            .network
            .allowed_peers
            .iter()
            .map(|peer| (peer.public_key.clone(), peer.address.clone()))
            .collect();

        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let (mined_tx, mined_rx) = mpsc::unbounded_channel();

        info!(
            address = %identity.address,
            public_key = %keypair.address(),
            height = latest_block.number,
            stakers = stake_registry.stakers(),
            "node initialized"
        );

        let node = Node {
            config,
            keypair,
            identity,
            reward_address,
            ledger,
            blocks,
            chain: ChainInfo {
                latest_block,
                mempool: Mempool::new(),
                checked_block_hashes: LruCache::new(CHECKED_BLOCKS_CAPACITY),
                sync_queue: SyncQueue::new(),
                stake_registry,
                catch_up,
            },
            peers: Peers::new(),
            peer_keys,
            miner: Miner::new(mined_tx),
            network_tx,
        };
        let channels = NodeChannels {
            network: network_rx,
            mined: mined_rx,
        };
        Ok((node, channels))
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn public_key(&self) -> String {
        self.keypair.address()
    }

    pub fn latest_block(&self) -> &Block {
        &self.chain.latest_block
    }

    pub fn mempool(&self) -> &Mempool {
        &self.chain.mempool
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn sync_state(&self) -> SyncState {
        self.chain.catch_up.state()
    }

    pub fn stake(&self, public_key: &str) -> Option<u64> {
        self.chain.stake_registry.get(public_key)
    }

    pub fn is_mining(&self) -> bool {
        self.miner.is_mining()
    }

    /// A competing block took the height being mined; the round's result will be dropped.
    pub fn mining_raced(&self) -> bool {
        self.miner.raced()
    }

    /// Binds the P2P listener, dials the bootstrap peers and runs the event loop
    /// until Ctrl-C.
    pub async fn run(mut self, mut channels: NodeChannels) -> Result<()> {
        let listener = TcpListener::bind(self.config.network.bind_address()).await?;
        let auth = Arc::new(PeerAuth::new(self.config.network.allow_list()));
        let events = self.network_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = network::listen(listener, auth, events).await {
                error!(error = %e, "P2P listener failed");
            }
        });

        for peer in self.config.network.bootstrap_peers.clone() {
            self.dial(peer);
        }

        let mut mining_tick = tokio::time::interval(self.config.miner.interval);
        let mut resync_tick = tokio::time::interval(self.config.sync.resync_interval);
        // intervals fire immediately once
        mining_tick.tick().await;
        resync_tick.tick().await;

        let warmup = tokio::time::sleep(self.config.network.warmup);
        tokio::pin!(warmup);
        let mut warmed_up = false;

        loop {
            let outcome = tokio::select! {
                Some(event) = channels.network.recv() => self.handle_network_event(event),
                Some(result) = channels.mined.recv() => self.on_mined(result),
                _ = &mut warmup, if !warmed_up => {
                    warmed_up = true;
                    self.on_warmup();
                    Ok(())
                }
                _ = mining_tick.tick() => self.on_mining_tick(),
                _ = resync_tick.tick() => {
                    self.on_resync();
                    Ok(())
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            };
            if let Err(e) = outcome {
                error!(error = %e, "event handler failed");
            }
        }

        self.miner.respawn();
        Ok(())
    }

    fn dial(&self, address: String) {
        if address == self.identity.address || self.peers.contains(&address) {
            return;
        }
        network::dial(address, self.identity.clone(), self.network_tx.clone());
    }

    /// Sends to `preferred` if connected, otherwise back to `origin`.
    fn reply(&self, preferred: &str, origin: &str, message: Message) {
        if !self.peers.send(preferred, message.clone()) && !self.peers.send(origin, message) {
            debug!(peer = %origin, "reply target not connected");
        }
    }

    fn request_block(&self, number: u64) {
        self.peers.broadcast(&Message::RequestBlock(BlockRequest {
            block_number: number,
            request_address: self.identity.address.clone(),
        }));
    }

    pub fn handle_network_event(&mut self, event: NetworkEvent) -> Result<()> {
        match event {
            NetworkEvent::Connected {
                address,
                connection,
                outbound,
            } => {
                self.peers.insert(address.clone(), connection, outbound);
                let mut known = self.peers.addresses();
                known.push(self.identity.address.clone());
                self.peers.send(&address, Message::Handshake(known));
                info!(peer = %address, peers = self.peers.len(), "peer registered");
                Ok(())
            }
            NetworkEvent::Received { address, message } => self.handle_message(&address, message),
            NetworkEvent::Disconnected {
                address,
                connection,
            } => {
                if self.peers.remove(&address, connection) {
                    info!(peer = %address, peers = self.peers.len(), "peer disconnected");
                }
                Ok(())
            }
        }
    }

    pub fn handle_message(&mut self, from: &str, message: Message) -> Result<()> {
        debug!(peer = %from, kind = message.kind(), "message received");
        match message {
            Message::Handshake(addresses) => {
                for address in addresses {
                    self.dial(address);
                }
                Ok(())
            }
            Message::CreateTransaction(tx) => self.on_create_transaction(tx),
            Message::RequestBlock(request) => {
                if let Some(block) = self.blocks.get_block(request.block_number)? {
                    self.reply(&request.request_address, from, Message::SendBlock(block));
                }
                Ok(())
            }
            Message::SendBlock(block) => self.on_send_block(block),
            Message::PublishBlock(block) => self.on_publish_block(block),
            Message::StartMining => {
                if self.config.miner.enabled && !self.miner.is_mining() && !self.chain.mempool.is_empty() {
                    self.mine()?;
                }
                Ok(())
            }
            Message::RequestPool(request) => {
                let pool = self.chain.mempool.transactions().to_vec();
                self.reply(&request.pool_request_address, from, Message::SendPool(pool));
                Ok(())
            }
            Message::SendPool(transactions) => {
                let kept = self.chain.mempool.replace(transactions, &self.ledger)?;
                debug!(peer = %from, kept, "pool replaced");
                Ok(())
            }
        }
    }

    fn on_create_transaction(&mut self, tx: Transaction) -> Result<()> {
        if self.chain.catch_up.is_catching_up() {
            debug!(tx = %tx.hash(), "ignoring transaction while catching up");
            return Ok(());
        }
        if self.chain.mempool.add_transaction(tx.clone(), &self.ledger)? {
            debug!(tx = %tx.hash(), pool = self.chain.mempool.len(), "transaction admitted");
            self.peers.broadcast(&Message::CreateTransaction(tx));
        }
        Ok(())
    }

    fn on_send_block(&mut self, block: Block) -> Result<()> {
        if !self.chain.catch_up.expects(block.number) {
            debug!(number = block.number, expected = ?self.chain.catch_up.expected(), "unexpected catch-up block");
            return Ok(());
        }

        let Some(mut next) = self.chain.sync_queue.add(block) else {
            return Ok(());
        };
        loop {
            if let Err(e) = self.apply_synced(next) {
                self.chain.sync_queue.clear();
                return Err(e);
            }
            match self.chain.sync_queue.wipe() {
                Some(block) => next = block,
                None => return Ok(()),
            }
        }
    }

    fn apply_synced(&mut self, block: Block) -> Result<()> {
        if !self.chain.catch_up.expects(block.number) {
            return Ok(());
        }
        if !self.accept_block(&block)? {
            warn!(number = block.number, "catch-up block rejected");
            return Ok(());
        }
        info!(number = block.number, "caught up block");
        self.miner.race_lost(block.number);
        if let Some(next) = self.chain.catch_up.advance(block.number) {
            self.request_block(next);
        }
        Ok(())
    }

    fn on_publish_block(&mut self, block: Block) -> Result<()> {
        // a copy carrying someone else's hash must not shadow the real block
        if block.hash != block.recompute_hash() {
            debug!(number = block.number, hash = %block.hash, "published block hash does not match contents");
            return Ok(());
        }
        if self
            .chain
            .checked_block_hashes
            .put(block.hash.clone(), ())
            .is_some()
        {
            return Ok(());
        }

        let number = block.number;
        if !self.accept_block(&block)? {
            debug!(number, hash = %block.hash, "published block rejected");
            return Ok(());
        }
        info!(number, hash = %block.hash, "accepted published block");

        self.miner.race_lost(number);
        self.chain.catch_up.advance(number);
        if number > 1 {
            self.chain.catch_up.mark_synced();
        }
        self.peers.broadcast(&Message::PublishBlock(block));
        Ok(())
    }

    /// Verifies `block` against the head and, if it passes, makes it the head.
    fn accept_block(&mut self, block: &Block) -> Result<bool> {
        if !verify_block(block, &self.chain.latest_block, &self.ledger)? {
            return Ok(false);
        }

        self.blocks.put_block(block)?;
        for tx in &block.data {
            if let TransactionData::Stake { amount } = tx.data {
                let total = self.chain.stake_registry.update(&tx.from, amount)?;
                debug!(staker = %tx.from, total, "stake updated");
            }
        }
        self.chain.latest_block = block.clone();
        self.chain.mempool.prune(&block.data);
        self.chain.checked_block_hashes.put(block.hash.clone(), ());
        Ok(true)
    }

    pub fn on_warmup(&mut self) {
        if !self.config.sync.catch_up {
            return;
        }
        if let Some(expected) = self.chain.catch_up.expected() {
            info!(expected, peers = self.peers.len(), "requesting chain from peers");
            self.request_block(expected);
        }
        self.peers.broadcast(&Message::RequestPool(PoolRequest {
            pool_request_address: self.identity.address.clone(),
        }));
        self.chain.catch_up.mark_synced();
    }

    pub fn on_resync(&mut self) {
        if let Some(expected) = self.chain.catch_up.expected() {
            self.request_block(expected);
        }
    }

    pub fn on_mining_tick(&mut self) -> Result<()> {
        if !self.config.miner.enabled
            || self.miner.is_mining()
            || self.chain.mempool.is_empty()
            || self.chain.catch_up.is_catching_up()
        {
            return Ok(());
        }

        let Some(forger) = self.chain.stake_registry.forger(&self.chain.latest_block.hash) else {
            debug!("no stakers, nobody can forge");
            return Ok(());
        };

        if forger == self.keypair.address() {
            return self.mine();
        }
        match self.peer_keys.get(&forger) {
            Some(address) if self.peers.send(address, Message::StartMining) => {
                debug!(forger = %address, "delegated mining");
            }
            _ => debug!(forger = %forger, "forger is not a connected peer"),
        }
        Ok(())
    }

    fn mine(&mut self) -> Result<()> {
        let candidates = select_transactions(self.chain.mempool.transactions(), &self.ledger)?;
        if candidates.is_empty() {
            debug!(pool = self.chain.mempool.len(), "no transaction can be replayed yet");
            return Ok(());
        }

        let reward = build_reward(&self.keypair, &self.reward_address, &candidates)?;
        let mut data = Vec::with_capacity(candidates.len() + 1);
        data.push(reward);
        data.extend(candidates);
        self.miner.start(self.chain.latest_block.clone(), data)
    }

    pub fn on_mined(&mut self, result: MiningResult) -> Result<()> {
        let Some(block) = self.miner.finish(result) else {
            return Ok(());
        };
        if !self.accept_block(&block)? {
            warn!(number = block.number, "mined block no longer extends the chain");
            return Ok(());
        }
        self.chain.catch_up.advance(block.number);
        info!(number = block.number, transactions = block.data.len(), hash = %block.hash, "forged block");
        self.peers.broadcast(&Message::PublishBlock(block));
        Ok(())
    }
}
