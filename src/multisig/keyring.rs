//! Shared public-key registry for a multisig wallet
//!
//! Every copayer contributes the extended public key of their BIP45 branch.
//! Address keys live at `cosigner / change / index` below each branch, and
//! the redeem script for a path is built from the keys of all copayers at
//! that path. Copayers are kept sorted by branch public key, which makes the
//! cosigner index of each copayer the same on every device.

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::core::{build_redeem_script, script_to_address, Address, Network, Script, ScriptError};
use crate::crypto::{ExtendedPrivKey, ExtendedPubKey, KeyError};

/// Largest wallet a standard redeem script can express
pub const MAX_COPAYERS: usize = 15;

/// Cosigner index of addresses that belong to no single copayer
pub const SHARED_INDEX: u32 = 0x7fff_ffff;

/// Errors related to the key ring
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyRingError {
    #[error("Invalid quorum: {required}-of-{total}")]
    InvalidQuorum { required: u8, total: u8 },
    #[error("All {0} copayers already joined")]
    QuorumFull(u8),
    #[error("Copayer already joined: {0}")]
    DuplicateCopayer(String),
    #[error("Extended key is for {found}, wallet is on {expected}")]
    NetworkMismatch { expected: Network, found: Network },
    #[error("Invalid extended key: {0}")]
    InvalidExtendedKey(#[from] KeyError),
    #[error("Key ring incomplete: {have} of {need} copayers")]
    IncompleteKeyRing { have: usize, need: u8 },
    #[error("Unknown copayer: {0}")]
    UnknownCopayer(String),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
}

/// One wallet participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Copayer {
    /// Hex HASH160 of the branch public key
    pub id: String,
    pub xpub: ExtendedPubKey,
}

impl Copayer {
    pub fn new(xpub: ExtendedPubKey) -> Self {
        Self {
            id: hex::encode(xpub.identifier()),
            xpub,
        }
    }
}

/// Position of an address below every copayer's branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressPath {
    pub cosigner: u32,
    pub is_change: bool,
    pub index: u32,
}

impl AddressPath {
    /// Path on the branch shared by all copayers
    pub fn shared(index: u32, is_change: bool) -> Self {
        Self {
            cosigner: SHARED_INDEX,
            is_change,
            index,
        }
    }

    pub fn for_cosigner(cosigner: u32, index: u32, is_change: bool) -> Self {
        Self {
            cosigner,
            is_change,
            index,
        }
    }

    /// Non-hardened derivation steps below the branch key
    pub fn components(&self) -> [u32; 3] {
        [self.cosigner, self.is_change as u32, self.index]
    }
}

impl std::fmt::Display for AddressPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "m/45'/{}/{}/{}",
            self.cosigner, self.is_change as u32, self.index
        )
    }
}

/// Redeem script and address for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedScript {
    pub path: AddressPath,
    pub redeem_script: Script,
    pub address: Address,
}

/// Registry of copayer keys for an M-of-N wallet
#[derive(Debug)]
pub struct KeyRing {
    required: u8,
    total: u8,
    network: Network,
    copayers: RwLock<Vec<Copayer>>,
    cache: RwLock<HashMap<AddressPath, DerivedScript>>,
}

impl KeyRing {
    /// Create an empty key ring for an M-of-N wallet
    pub fn new(required: u8, total: u8, network: Network) -> Result<Self, KeyRingError> {
        if required == 0 || required > total || total as usize > MAX_COPAYERS {
            return Err(KeyRingError::InvalidQuorum { required, total });
        }
        Ok(Self {
            required,
            total,
            network,
            copayers: RwLock::new(Vec::with_capacity(total as usize)),
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn required(&self) -> u8 {
        self.required
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Add a copayer's branch xpub; the set freezes once N have joined
    pub fn add_copayer(&self, xpub: ExtendedPubKey) -> Result<Copayer, KeyRingError> {
        if xpub.network() != self.network {
            return Err(KeyRingError::NetworkMismatch {
                expected: self.network,
                found: xpub.network(),
            });
        }

        let copayer = Copayer::new(xpub);
        let mut copayers = self.copayers.write().unwrap_or_else(PoisonError::into_inner);

        if copayers.len() >= self.total as usize {
            return Err(KeyRingError::QuorumFull(self.total));
        }
        if copayers.iter().any(|c| c.id == copayer.id) {
            return Err(KeyRingError::DuplicateCopayer(copayer.id));
        }

        let key = copayer.xpub.public_key().serialize();
        let position = copayers.partition_point(|c| c.xpub.public_key().serialize() < key);
        copayers.insert(position, copayer.clone());

        log::info!(
            "Copayer {} joined ({}/{})",
            copayer.id,
            copayers.len(),
            self.total
        );
        Ok(copayer)
    }

    /// Parse and add a Base58 xpub
    pub fn add_copayer_str(&self, xpub: &str) -> Result<Copayer, KeyRingError> {
        self.add_copayer(xpub.parse()?)
    }

    pub fn is_complete(&self) -> bool {
        self.copayer_count() == self.total as usize
    }

    pub fn copayer_count(&self) -> usize {
        self.copayers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of the copayers in cosigner order
    pub fn copayers(&self) -> Vec<Copayer> {
        self.copayers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cosigner index of a copayer
    pub fn copayer_index(&self, id: &str) -> Option<u32> {
        self.copayers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(|c| c.id == id)
            .map(|i| i as u32)
    }

    fn complete_copayers(&self) -> Result<Vec<Copayer>, KeyRingError> {
        let copayers = self.copayers();
        if copayers.len() != self.total as usize {
            return Err(KeyRingError::IncompleteKeyRing {
                have: copayers.len(),
                need: self.total,
            });
        }
        Ok(copayers)
    }

    /// Per-copayer keys on the shared branch, in cosigner order
    pub fn derive_public_keys(
        &self,
        index: u32,
        is_change: bool,
    ) -> Result<Vec<PublicKey>, KeyRingError> {
        self.derive_public_keys_for(&AddressPath::shared(index, is_change))
    }

    /// Per-copayer keys at `path`, in cosigner order
    pub fn derive_public_keys_for(
        &self,
        path: &AddressPath,
    ) -> Result<Vec<PublicKey>, KeyRingError> {
        let components = path.components();
        self.complete_copayers()?
            .iter()
            .map(|c| Ok(c.xpub.derive_path(&components)?.public_key()))
            .collect()
    }

    /// One copayer's key at `path`
    pub fn pubkey_for(
        &self,
        path: &AddressPath,
        copayer_index: u32,
    ) -> Result<PublicKey, KeyRingError> {
        let copayers = self.copayers();
        let copayer = copayers
            .get(copayer_index as usize)
            .ok_or_else(|| KeyRingError::UnknownCopayer(copayer_index.to_string()))?;
        Ok(copayer.xpub.derive_path(&path.components())?.public_key())
    }

    /// Redeem script and address at `path`, cached after the first derivation
    pub fn derived_script(&self, path: &AddressPath) -> Result<DerivedScript, KeyRingError> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Ok(hit.clone());
        }

        let keys = self.derive_public_keys_for(path)?;
        if keys.len() != self.total as usize {
            return Err(ScriptError::InvalidKeyCount {
                expected: self.total as usize,
                got: keys.len(),
            }
            .into());
        }
        let redeem_script = build_redeem_script(&keys, self.required)?;
        let derived = DerivedScript {
            path: *path,
            address: script_to_address(&redeem_script, self.network),
            redeem_script,
        };

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*path, derived.clone());
        Ok(derived)
    }

    /// P2SH address for `index` on the given cosigner branch
    pub fn get_address(
        &self,
        index: u32,
        is_change: bool,
        cosigner: u32,
    ) -> Result<Address, KeyRingError> {
        let path = AddressPath::for_cosigner(cosigner, index, is_change);
        Ok(self.derived_script(&path)?.address)
    }

    /// Address → redeem script for a set of paths
    pub fn redeem_script_map(
        &self,
        paths: &[AddressPath],
    ) -> Result<HashMap<Address, Script>, KeyRingError> {
        paths
            .iter()
            .map(|path| {
                let derived = self.derived_script(path)?;
                Ok((derived.address, derived.redeem_script))
            })
            .collect()
    }

    /// Find the path an address was derived at
    ///
    /// Looks at already-derived paths first, then walks receive and change
    /// indexes below `search_limit` on the shared branch and on every
    /// copayer's own branch.
    pub fn path_for_address(
        &self,
        address: &Address,
        search_limit: u32,
    ) -> Result<Option<AddressPath>, KeyRingError> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|d| d.address == *address)
        {
            return Ok(Some(hit.path));
        }

        let copayers = self.complete_copayers()?.len() as u32;
        let branches = std::iter::once(SHARED_INDEX).chain(0..copayers);
        for cosigner in branches {
            for index in 0..search_limit {
                for is_change in [false, true] {
                    let path = AddressPath::for_cosigner(cosigner, index, is_change);
                    if self.derived_script(&path)?.address == *address {
                        return Ok(Some(path));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Secret key for `path` below a copayer's own branch key
pub fn derive_private_key(
    branch: &ExtendedPrivKey,
    path: &AddressPath,
) -> Result<SecretKey, KeyRingError> {
    Ok(branch.derive_path(&path.components())?.secret_key())
}

// =============================================================================
// Tests
// =============================================================================
