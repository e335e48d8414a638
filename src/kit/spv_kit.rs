//! Wallet kit facade
//!
//! Wires storage, keys, the transaction pipeline and the peer group
//! together and exposes the operations an application needs.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;

use super::config::KitConfig;
use super::data_provider::{BlockInfo, DataProvider};
use super::listener::{KitListener, ListenerSlot};
use super::sync_manager::{KitState, SyncManager};
use crate::core::address::{
    AddressConverter, AddressConverterChain, AddressError, Base58AddressConverter, SegwitAddressConverter,
};
use crate::core::bloom::BloomFilter;
use crate::core::blockchain::{Blockchain, BlockchainDataListener};
use crate::core::transaction::FullTransaction;
use crate::core::validator::validators_for;
use crate::network::addrman::PeerAddressManager;
use crate::network::initial_block_download::InitialBlockDownload;
use crate::network::mempool_transactions::MempoolTransactions;
use crate::network::params::NetworkParams;
use crate::network::peer_group::{PeerGroup, PeerGroupError, PeerGroupHandle, PeerGroupStatus};
use crate::network::sync::{resolve_checkpoint, BlockSyncer, SyncError};
use crate::storage::{FullTransactionInfo, Storage, StorageError, TransactionFilterType, UnspentOutput};
use crate::transactions::builder::{BuilderError, SendRequest, TransactionBuilder};
use crate::transactions::conflicts::TransactionConflictsResolver;
use crate::transactions::creator::{CreatorError, TransactionCreator};
use crate::transactions::dust::DustCalculator;
use crate::transactions::extractor::TransactionExtractor;
use crate::transactions::fee_calculator::{SendInfo, TransactionFeeCalculator};
use crate::transactions::invalidator::TransactionInvalidator;
use crate::transactions::outputs_cache::OutputsCache;
use crate::transactions::plugin::{LockHeightPlugin, PluginData, PluginError, PluginManager};
use crate::transactions::processor::{BlockTransactionProcessor, PendingTransactionProcessor, ProcessorContext};
use crate::transactions::selector::{
    GreedyUnspentOutputSelector, SingleNoChangeUnspentOutputSelector, UnspentOutputSelectorChain,
};
use crate::transactions::sender::{TransactionBroadcaster, TransactionSender};
use crate::transactions::signer::TransactionSigner;
use crate::transactions::size::{SizeCalculator, TransactionSizeCalculator};
use crate::transactions::unspent_output_provider::{BalanceInfo, UnspentOutputProvider, UnspentOutputSource};
use crate::wallet::{
    BloomFilterListener, BloomFilterManager, IrregularOutputFinder, KeyChainError, PublicKeyManager,
    PublicKeyManagerError, SeedKeyChain, TransactionFilter, WatchedTransactionListener, WatchedTransactionManager,
};

#[derive(Error, Debug)]
pub enum KitError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key chain error: {0}")]
    KeyChain(#[from] KeyChainError),
    #[error("Public key error: {0}")]
    PublicKey(#[from] PublicKeyManagerError),
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),
    #[error("{0}")]
    Builder(#[from] BuilderError),
    #[error("{0}")]
    Creator(#[from] CreatorError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("{0}")]
    PeerGroup(#[from] PeerGroupError),
}

// =============================================================================
// Network Link
// =============================================================================

/// Stands in for the peer group while it is stopped
#[derive(Default)]
struct NetworkLink {
    handle: RwLock<Option<PeerGroupHandle>>,
}

impl NetworkLink {
    fn set(&self, handle: Option<PeerGroupHandle>) {
        *self.handle.write() = handle;
    }

    fn take(&self) -> Option<PeerGroupHandle> {
        self.handle.write().take()
    }

    fn status(&self) -> Option<PeerGroupStatus> {
        self.handle.read().as_ref().map(|h| h.status())
    }
}

impl TransactionBroadcaster for NetworkLink {
    fn can_send_transaction(&self) -> Result<(), PeerGroupError> {
        match self.handle.read().as_ref() {
            Some(handle) => handle.can_send_transaction(),
            None => Err(PeerGroupError::PeersNotSynced),
        }
    }

    fn send_pending_transactions(&self) {
        if let Some(handle) = self.handle.read().as_ref() {
            handle.send_pending_transactions();
        }
    }
}

impl BloomFilterListener for NetworkLink {
    fn on_filter_updated(&self, filter: Arc<BloomFilter>) {
        if let Some(handle) = self.handle.read().as_ref() {
            handle.on_filter_updated(filter);
        }
    }
}

// =============================================================================
// Kit
// =============================================================================

pub struct SpvKit {
    config: KitConfig,
    params: NetworkParams,
    storage: Arc<dyn Storage>,
    address_converter: Arc<dyn AddressConverter>,
    plugin_manager: Arc<PluginManager>,
    public_key_manager: Arc<PublicKeyManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    watched_transaction_manager: Arc<WatchedTransactionManager>,
    unspent_output_provider: Arc<UnspentOutputProvider>,
    blockchain: Arc<Blockchain>,
    block_processor: Arc<BlockTransactionProcessor>,
    pending_processor: Arc<PendingTransactionProcessor>,
    sender: Arc<TransactionSender>,
    fee_calculator: TransactionFeeCalculator,
    creator: TransactionCreator,
    data_provider: Arc<DataProvider>,
    sync_manager: Arc<SyncManager>,
    listeners: Arc<ListenerSlot>,
    network: Arc<NetworkLink>,
    peer_group_task: Mutex<Option<JoinHandle<()>>>,
}

impl SpvKit {
    /// Build a kit for the wallet of `seed` on top of `storage`
    pub fn new(config: KitConfig, seed: &[u8], storage: Arc<dyn Storage>) -> Result<Self, KitError> {
        let params = NetworkParams::for_network(config.network);
        log::info!("Creating wallet kit for {}", params.network);

        let key_chain = Arc::new(SeedKeyChain::from_seed(seed, config.purpose, params.coin_type)?);
        let public_key_manager = Arc::new(PublicKeyManager::new(storage.clone(), key_chain.clone(), config.gap_limit));
        public_key_manager.fill_gap()?;

        let mut converter = AddressConverterChain::new();
        converter.push(Box::new(Base58AddressConverter::new(
            params.pub_key_hash_prefix,
            params.script_hash_prefix,
        )));
        converter.push(Box::new(SegwitAddressConverter::new(&params.bech32_hrp)));
        let address_converter: Arc<dyn AddressConverter> = Arc::new(converter);

        let plugin_manager = Arc::new(PluginManager::new());
        plugin_manager.add_plugin(Arc::new(LockHeightPlugin::new(address_converter.clone())));

        let listeners = Arc::new(ListenerSlot::default());
        let unspent_output_provider = Arc::new(UnspentOutputProvider::new(
            storage.clone(),
            config.confirmations_threshold,
            plugin_manager.clone(),
        ));
        let data_provider = Arc::new(DataProvider::new(
            storage.clone(),
            unspent_output_provider.clone(),
            listeners.clone(),
        ));
        let data_listener: Arc<dyn BlockchainDataListener> = data_provider.clone();

        // Incoming transaction pipeline
        let watched_transaction_manager = Arc::new(WatchedTransactionManager::new());
        let irregular_output_finder = Arc::new(IrregularOutputFinder::new(storage.clone()));
        let context = Arc::new(ProcessorContext::new(
            storage.clone(),
            Arc::new(TransactionExtractor::new(
                storage.clone(),
                address_converter.clone(),
                plugin_manager.clone(),
                Arc::new(OutputsCache::new()),
            )),
            public_key_manager.clone(),
            irregular_output_finder.clone(),
            Arc::new(TransactionConflictsResolver::new(storage.clone())),
            Arc::new(TransactionInvalidator::new(storage.clone(), data_listener.clone())),
            watched_transaction_manager.clone(),
            data_listener.clone(),
        ));
        let block_processor = Arc::new(BlockTransactionProcessor::new(context.clone()));
        let pending_processor = Arc::new(PendingTransactionProcessor::new(context));

        let network = Arc::new(NetworkLink::default());
        let bloom_filter_manager = Arc::new(BloomFilterManager::new());
        bloom_filter_manager.add_provider(public_key_manager.clone());
        bloom_filter_manager.add_provider(watched_transaction_manager.clone());
        bloom_filter_manager.add_provider(irregular_output_finder);
        bloom_filter_manager.add_listener(network.clone());

        let validator = validators_for(&params, storage.clone());
        let blockchain = Arc::new(Blockchain::new(storage.clone(), Some(Box::new(validator)), data_listener));

        // Outgoing transaction pipeline
        let size_calculator: Arc<dyn SizeCalculator> = Arc::new(TransactionSizeCalculator::new());
        let dust_calculator = Arc::new(DustCalculator::new(params.dust_relay_fee_rate, size_calculator.clone()));
        let source: Arc<dyn UnspentOutputSource> = unspent_output_provider.clone();
        let mut selector = UnspentOutputSelectorChain::new(source.clone());
        selector.push(Box::new(SingleNoChangeUnspentOutputSelector::new(
            size_calculator.clone(),
            dust_calculator.clone(),
            source.clone(),
        )));
        selector.push(Box::new(GreedyUnspentOutputSelector::new(
            size_calculator.clone(),
            dust_calculator.clone(),
            source.clone(),
            None,
        )));

        let builder = Arc::new(TransactionBuilder::new(
            storage.clone(),
            address_converter.clone(),
            Arc::new(selector),
            size_calculator.clone(),
            dust_calculator.clone(),
            public_key_manager.clone(),
            plugin_manager.clone(),
            TransactionSigner::new(key_chain),
            config.purpose.script_type(),
        ));
        let fee_calculator = TransactionFeeCalculator::new(
            builder.clone(),
            source,
            size_calculator,
            dust_calculator,
            public_key_manager.clone(),
            address_converter.clone(),
            plugin_manager.clone(),
        );
        let sender = Arc::new(TransactionSender::new(
            storage.clone(),
            config.max_retries,
            config.retries_period,
        ));
        let creator = TransactionCreator::new(
            builder,
            pending_processor.clone(),
            network.clone(),
            public_key_manager.clone(),
            bloom_filter_manager.clone(),
        );

        let best_block_height = storage.last_block().map(|b| b.height).unwrap_or(0);
        let sync_manager = Arc::new(SyncManager::new(best_block_height, listeners.clone()));

        Ok(Self {
            config,
            params,
            storage,
            address_converter,
            plugin_manager,
            public_key_manager,
            bloom_filter_manager,
            watched_transaction_manager,
            unspent_output_provider,
            blockchain,
            block_processor,
            pending_processor,
            sender,
            fee_calculator,
            creator,
            data_provider,
            sync_manager,
            listeners,
            network,
            peer_group_task: Mutex::new(None),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn KitListener>) {
        self.listeners.set(listener);
    }

    pub fn network_params(&self) -> &NetworkParams {
        &self.params
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start syncing; must be called from within a tokio runtime
    pub fn start(&self) -> Result<(), KitError> {
        let mut task = self.peer_group_task.lock();
        if task.is_some() {
            return Ok(());
        }

        let checkpoint = match resolve_checkpoint(self.config.sync_mode, &self.params, self.storage.as_ref()) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.sync_manager.failed(&e);
                return Err(e.into());
            }
        };
        self.sync_manager.start();
        self.bloom_filter_manager.regenerate_bloom_filter();

        let syncer = BlockSyncer::new(
            self.storage.clone(),
            self.blockchain.clone(),
            self.block_processor.clone(),
            self.public_key_manager.clone(),
            self.bloom_filter_manager.clone(),
            checkpoint,
            self.sync_manager.clone(),
        );
        let mempool = MempoolTransactions::new(
            self.storage.clone(),
            self.pending_processor.clone(),
            self.public_key_manager.clone(),
            self.bloom_filter_manager.clone(),
            self.sender.clone(),
        );
        let addrman = PeerAddressManager::new(self.storage.clone(), self.params.dns_seeds.clone(), self.params.port);

        let (group, handle) = PeerGroup::new(
            self.params.clone(),
            self.config.peer_group_config(),
            InitialBlockDownload::new(syncer),
            mempool,
            self.sender.clone(),
            addrman,
            self.bloom_filter_manager.bloom_filter(),
        );
        self.network.set(Some(handle));
        *task = Some(tokio::spawn(group.run()));

        log::info!("Wallet kit started");
        Ok(())
    }

    /// Close every connection and wait for the peer group to finish
    pub async fn stop(&self) {
        if let Some(handle) = self.network.take() {
            handle.stop();
        }
        let task = self.peer_group_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Peer group task failed: {}", e);
            }
        }

        self.sync_manager.stop();
        if let Err(e) = self.storage.flush() {
            log::error!("Failed to flush storage: {}", e);
        }
        log::info!("Wallet kit stopped");
    }

    /// Start if stopped, otherwise refresh the balance and resend pending
    pub fn refresh(&self) -> Result<(), KitError> {
        self.start()?;
        self.data_provider.refresh_balance();
        self.network.send_pending_transactions();
        Ok(())
    }

    pub fn sync_state(&self) -> KitState {
        self.sync_manager.state()
    }

    /// Connected and synced peer counts; `None` while stopped
    pub fn peer_status(&self) -> Option<PeerGroupStatus> {
        self.network.status()
    }

    // -------------------------------------------------------------------------
    // Wallet data
    // -------------------------------------------------------------------------

    pub fn balance(&self) -> BalanceInfo {
        self.data_provider.balance()
    }

    pub fn last_block_info(&self) -> Option<BlockInfo> {
        self.data_provider.last_block_info()
    }

    pub fn transactions(
        &self,
        from_hash: Option<&str>,
        filter: Option<TransactionFilterType>,
        limit: Option<usize>,
    ) -> Vec<FullTransactionInfo> {
        self.data_provider.transactions(from_hash, filter, limit)
    }

    pub fn get_transaction(&self, hash: &str) -> Option<FullTransactionInfo> {
        self.data_provider.transaction(hash)
    }

    pub fn unspent_outputs(&self) -> Vec<UnspentOutput> {
        self.unspent_output_provider.spendable_outputs()
    }

    pub fn receive_address(&self) -> Result<String, KitError> {
        let key = self.public_key_manager.receive_public_key()?;
        Ok(self
            .address_converter
            .convert_public_key(&key, self.config.purpose.script_type())?
            .string)
    }

    pub fn change_address(&self) -> Result<String, KitError> {
        let key = self.public_key_manager.change_public_key()?;
        Ok(self
            .address_converter
            .convert_public_key(&key, self.config.purpose.script_type())?
            .string)
    }

    pub fn validate_address(&self, address: &str, plugin_data: &[PluginData]) -> Result<(), KitError> {
        let address = self.address_converter.convert_str(address)?;
        self.plugin_manager.process_outputs(address, plugin_data)?;
        Ok(())
    }

    /// Follow a foreign output or outpoint
    pub fn watch_transaction(&self, filter: TransactionFilter, listener: Arc<dyn WatchedTransactionListener>) {
        self.watched_transaction_manager.add(filter, listener);
        self.bloom_filter_manager.regenerate_bloom_filter();
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// A request carrying the configured RBF and ordering defaults
    pub fn send_request(&self, address: impl Into<String>, value: u64, fee_rate: u64) -> SendRequest {
        let mut request = SendRequest::new(address, value, fee_rate);
        request.rbf_enabled = self.config.rbf_enabled;
        request.sort_type = self.config.sort_type;
        request
    }

    pub fn send(&self, request: &SendRequest) -> Result<FullTransaction, KitError> {
        Ok(self.creator.create(request)?)
    }

    /// Spend exactly `outputs`; the fee comes out of their total
    pub fn send_unspent_outputs(
        &self,
        outputs: Vec<UnspentOutput>,
        address: &str,
        fee_rate: u64,
    ) -> Result<FullTransaction, KitError> {
        let value = outputs.iter().map(|u| u.output.value).sum();
        let mut request = self.send_request(address, value, fee_rate);
        request.sender_pay = false;
        request.unspent_outputs = Some(outputs);
        self.send(&request)
    }

    /// Fee for `request`; an empty address estimates with a placeholder
    pub fn fee(&self, request: &SendRequest) -> Result<u64, KitError> {
        Ok(self.fee_calculator.fee(request)?)
    }

    pub fn send_info(&self, request: &SendRequest) -> Result<SendInfo, KitError> {
        Ok(self.fee_calculator.send_info(request)?)
    }

    pub fn maximum_spendable_value(
        &self,
        address: Option<&str>,
        fee_rate: u64,
        plugin_data: &[PluginData],
    ) -> Result<u64, KitError> {
        Ok(self
            .fee_calculator
            .maximum_spendable_value(address, fee_rate, plugin_data)?)
    }

    pub fn minimum_spendable_value(
        &self,
        address: Option<&str>,
        plugin_data: &[PluginData],
        dust_threshold: Option<u64>,
    ) -> Result<u64, KitError> {
        Ok(self
            .fee_calculator
            .minimum_spendable_value(address, plugin_data, dust_threshold)?)
    }
}
