//! Multi-signature wallet and transaction support
//!
//! Provides M-of-N wallets where M signatures from N copayers are required
//! to spend funds.
//!
//! # Example
//!
//! ```ignore
//! use copay_core::multisig::{KeyRing, TransactionBuilder, TxProposalStore};
//!
//! // A 2-of-3 wallet
//! let ring = KeyRing::new(2, 3, Network::Testnet)?;
//! for xpub in copayer_xpubs {
//!     ring.add_copayer(xpub)?;
//! }
//!
//! // Build and propose a spend
//! let builder = TransactionBuilder::new(options)
//!     .set_unspent(unspent)?
//!     .set_outputs(outputs)?
//!     .set_hash_to_script_map(&ring.redeem_script_map(&paths)?)?
//!     .sign(&my_keys)?;
//! let id = store.insert(TxProposal::new(builder, &my_id, None, 2, 3)?).await?;
//!
//! // Another copayer completes it
//! store.sign(&id, &their_id, their_keys).await?;
//! ```

pub mod builder;
pub mod keyring;
pub mod proposal;
pub mod store;

pub use builder::{
    BuilderError, BuilderOptions, BuilderState, OutputSpec, TransactionBuilder, UnspentOutput,
};
pub use keyring::{
    derive_private_key, AddressPath, Copayer, DerivedScript, KeyRing, KeyRingError, MAX_COPAYERS,
    SHARED_INDEX,
};
pub use proposal::{ProposalError, ProposalState, TxProposal};
pub use store::TxProposalStore;
