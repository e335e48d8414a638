//! Transaction pipeline
//!
//! Incoming side: extraction of own outputs and inputs, conflict
//! resolution, invalidation and the block / pending processors.
//!
//! Outgoing side: unspent output selection, size and dust math, fee
//! calculation, building, signing and the send flow with its retry
//! bookkeeping.

pub mod builder;
pub mod conflicts;
pub mod creator;
pub mod dust;
pub mod extractor;
pub mod fee_calculator;
pub mod invalidator;
pub mod outputs_cache;
pub mod plugin;
pub mod processor;
pub mod selector;
pub mod sender;
pub mod signer;
pub mod size;
pub mod unspent_output_provider;

pub use builder::{BuilderError, SendRequest, TransactionBuilder, TransactionDataSortType};
pub use conflicts::{ConflictResolution, TransactionConflictsResolver};
pub use creator::{CreatorError, TransactionCreator};
pub use dust::DustCalculator;
pub use extractor::TransactionExtractor;
pub use fee_calculator::{SendInfo, TransactionFeeCalculator};
pub use invalidator::TransactionInvalidator;
pub use outputs_cache::OutputsCache;
pub use plugin::{LockHeightPlugin, Plugin, PluginData, PluginError, PluginManager};
pub use processor::{BlockTransactionProcessor, PendingTransactionProcessor, ProcessorContext, ProcessorError};
pub use selector::{
    GreedyUnspentOutputSelector, SelectedUnspentOutputInfo, SendValueError, SingleNoChangeUnspentOutputSelector,
    UnspentOutputSelector, UnspentOutputSelectorChain,
};
pub use sender::{TransactionBroadcaster, TransactionSender};
pub use signer::{SignerError, TransactionSigner};
pub use size::{SizeCalculator, TransactionSizeCalculator};
pub use unspent_output_provider::{BalanceInfo, UnspentOutputProvider, UnspentOutputSource};
