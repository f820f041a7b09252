//! Test fixtures
//!
//! Every helper builds fresh values; nothing is cached between tests.

use async_trait::async_trait;
use chrono::Utc;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use secp256k1::{Secp256k1, SecretKey};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::WalletConfig;
use crate::core::{Address, FeePolicy, Network, Transaction, TxOut, Txid};
use crate::crypto::ExtendedPrivKey;
use crate::multisig::{
    derive_private_key, AddressPath, BuilderOptions, Copayer, KeyRing, OutputSpec,
    TransactionBuilder, TxProposal, UnspentOutput, SHARED_INDEX,
};
use crate::paypro::{
    MerchantTransport, Output, Payment, PaymentAck, PaymentDetails, PaymentRequest, ProtoMessage,
    TransportError, TrustStore, X509Certificates,
};
use crate::wallet::{Broadcaster, CollaboratorError, Collaborators, ProposalNetwork, UnspentSource, Wallet};

// =============================================================================
// Keys and key rings
// =============================================================================

/// BIP45 branch key of test copayer `seed`
pub fn copayer_branch(network: Network, seed: u8) -> ExtendedPrivKey {
    ExtendedPrivKey::from_seed(network, &[seed; 32])
        .unwrap()
        .bip45_branch()
        .unwrap()
}

/// Complete M-of-N testnet key ring of copayers 1..=N
pub fn test_keyring(required: u8, total: u8) -> KeyRing {
    let ring = KeyRing::new(required, total, Network::Testnet).unwrap();
    for seed in 1..=total {
        ring.add_copayer(copayer_branch(Network::Testnet, seed).to_xpub())
            .unwrap();
    }
    ring
}

/// Copayer `seed`'s secret key at `path`
pub fn signing_key(seed: u8, path: &AddressPath) -> SecretKey {
    derive_private_key(&copayer_branch(Network::Testnet, seed), path).unwrap()
}

/// Keys a copayer holds for the two funded shared addresses
pub fn shared_keys(ring: &KeyRing, copayer_id: &str) -> Vec<SecretKey> {
    let seed = (1..=ring.total())
        .find(|&seed| Copayer::new(copayer_branch(ring.network(), seed).to_xpub()).id == copayer_id)
        .unwrap();
    [AddressPath::shared(0, false), AddressPath::shared(1, false)]
        .iter()
        .map(|path| signing_key(seed, path))
        .collect()
}

/// A P2PKH address outside the wallet
pub fn merchant_address(network: Network) -> Address {
    let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
    let public = secret.public_key(&Secp256k1::new());
    Address::p2pkh(&public, network)
}

// =============================================================================
// Builders and proposals
// =============================================================================

/// An unspent output paying the wallet address at `path`
pub fn unspent_at(
    ring: &KeyRing,
    path: &AddressPath,
    amount: u64,
    confirmations: u32,
    tag: u8,
) -> UnspentOutput {
    let derived = ring.derived_script(path).unwrap();
    UnspentOutput {
        txid: Txid::from_internal([tag; 32]),
        vout: 0,
        address: derived.address,
        script_pub_key: derived.address.script_pubkey(),
        amount,
        confirmations,
    }
}

/// The two outputs funding the shared receive addresses 0 and 1
pub fn funding(ring: &KeyRing) -> Vec<UnspentOutput> {
    vec![
        unspent_at(ring, &AddressPath::shared(0, false), 5_000_000, 6, 1),
        unspent_at(ring, &AddressPath::shared(1, false), 20_000_000, 3, 2),
    ]
}

/// An unsigned proposal paying the merchant 1 BTC cent, created by the
/// first copayer
pub fn proposal_fixture(required: u8, total: u8) -> (KeyRing, TxProposal) {
    let ring = test_keyring(required, total);
    let options = BuilderOptions {
        fee_policy: FeePolicy::default(),
        change_address: Some(ring.get_address(0, true, SHARED_INDEX).unwrap()),
        spend_unconfirmed: false,
        required_signatures: required,
        total_signers: total,
    };
    let paths = [AddressPath::shared(0, false), AddressPath::shared(1, false)];
    let builder = TransactionBuilder::new(options)
        .set_unspent(funding(&ring))
        .unwrap()
        .set_outputs(vec![OutputSpec::to_address(
            &merchant_address(Network::Testnet),
            1_000_000,
        )])
        .unwrap()
        .set_hash_to_script_map(&ring.redeem_script_map(&paths).unwrap())
        .unwrap();

    let creator = ring.copayers()[0].id.clone();
    let proposal = TxProposal::new(builder, &creator, None, required, total).unwrap();
    (ring, proposal)
}

// =============================================================================
// Merchant PKI and requests
// =============================================================================

/// A root CA and a merchant certificate it issued
pub struct MerchantPki {
    root: Certificate,
    root_der: Vec<u8>,
    chain: Vec<Vec<u8>>,
    signing_key: Vec<u8>,
}

impl MerchantPki {
    pub fn new() -> Self {
        Self::build(false, false)
    }

    /// Merchant certificate valid only during 2000
    pub fn expired() -> Self {
        Self::build(true, false)
    }

    /// Chain where the merchant's end-entity certificate issued another
    /// one for a name it does not own; requests are signed by the latter
    pub fn issued_by_merchant() -> Self {
        Self::build(false, true)
    }

    fn build(expired: bool, issue_below_leaf: bool) -> Self {
        let mut root_params = CertificateParams::default();
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params
            .distinguished_name
            .push(DnType::CommonName, "Test Root CA");
        let root = Certificate::from_params(root_params).unwrap();
        let root_der = root.serialize_der().unwrap();

        let mut leaf_params = CertificateParams::new(vec!["merchant.example".to_string()]);
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "merchant.example");
        if expired {
            leaf_params.not_before = rcgen::date_time_ymd(2000, 1, 1);
            leaf_params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        }
        let leaf = Certificate::from_params(leaf_params).unwrap();
        let leaf_der = leaf.serialize_der_with_signer(&root).unwrap();

        if !issue_below_leaf {
            return Self {
                root,
                root_der,
                chain: vec![leaf_der],
                signing_key: leaf.serialize_private_key_der(),
            };
        }

        let mut sub_params = CertificateParams::new(vec!["bank.example".to_string()]);
        sub_params
            .distinguished_name
            .push(DnType::CommonName, "bank.example");
        let sub = Certificate::from_params(sub_params).unwrap();
        let sub_der = sub.serialize_der_with_signer(&leaf).unwrap();

        Self {
            root,
            root_der,
            chain: vec![sub_der, leaf_der],
            signing_key: sub.serialize_private_key_der(),
        }
    }

    pub fn trust_store(&self) -> TrustStore {
        let mut trust = TrustStore::new();
        trust.add_der(self.root_der.clone()).unwrap();
        trust
    }

    pub fn root_pem(&self) -> String {
        self.root.serialize_pem().unwrap()
    }

    /// Merchant chain, leaf first
    pub fn chain(&self) -> Vec<Vec<u8>> {
        self.chain.clone()
    }

    /// ECDSA P-256 signature by the merchant key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.signing_key, &rng)
            .unwrap();
        key.sign(&rng, message).unwrap().as_ref().to_vec()
    }
}

/// Payment terms paying `amounts` to the merchant address
pub fn merchant_details(network: Network, amounts: &[u64], expires: Option<u64>) -> PaymentDetails {
    let script = merchant_address(network).script_pubkey();
    PaymentDetails {
        network: Some(network.paypro_name().to_string()),
        outputs: amounts
            .iter()
            .map(|&amount| Output::new(amount, script.clone()))
            .collect(),
        time: Utc::now().timestamp() as u64,
        expires,
        memo: Some("Order #42".to_string()),
        payment_url: Some("https://merchant.example/pay".to_string()),
        merchant_data: Some(b"invoice-42".to_vec()),
    }
}

/// An x509+sha256 request signed by the merchant certificate
pub fn signed_request(pki: &MerchantPki, serialized_details: Vec<u8>) -> PaymentRequest {
    let mut request = PaymentRequest {
        payment_details_version: Some(1),
        pki_type: Some("x509+sha256".to_string()),
        pki_data: Some(
            X509Certificates {
                certificates: pki.chain(),
            }
            .encode(),
        ),
        serialized_payment_details: serialized_details,
        signature: None,
    };
    request.signature = Some(pki.sign(&request.signing_bytes()));
    request
}

pub fn unsigned_request(serialized_details: Vec<u8>) -> PaymentRequest {
    PaymentRequest {
        pki_type: Some("none".to_string()),
        serialized_payment_details: serialized_details,
        ..Default::default()
    }
}

// =============================================================================
// Fake services
// =============================================================================

/// Serves one payment request and acknowledges every payment
pub struct FakeMerchant {
    request: Vec<u8>,
    ack_total: Option<u64>,
    delay: Option<Duration>,
    submitted: Mutex<Vec<Payment>>,
}

impl FakeMerchant {
    pub fn new(request: Vec<u8>) -> Self {
        Self {
            request,
            ack_total: None,
            delay: None,
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Acknowledge with a transaction paying `total` instead of the one sent
    pub fn with_ack_total(mut self, total: u64) -> Self {
        self.ack_total = Some(total);
        self
    }

    /// Take `delay` to answer each payment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn submitted(&self) -> Vec<Payment> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MerchantTransport for FakeMerchant {
    async fn fetch_request(&self, _url: &str) -> Result<Vec<u8>, TransportError> {
        Ok(self.request.clone())
    }

    async fn submit_payment(&self, _url: &str, payment: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let payment =
            Payment::decode(&payment).map_err(|e| TransportError::Network(e.to_string()))?;
        self.submitted.lock().unwrap().push(payment.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut echoed = payment;
        if let Some(total) = self.ack_total {
            let tx = Transaction::new(
                Vec::new(),
                vec![TxOut {
                    value: total,
                    script_pubkey: merchant_address(Network::Testnet).script_pubkey(),
                }],
            );
            echoed.transactions = vec![tx.serialize()];
        }
        Ok(PaymentAck {
            payment: echoed,
            memo: Some("Payment received".to_string()),
        }
        .encode())
    }
}

pub struct FakeUnspent {
    outputs: Vec<UnspentOutput>,
}

#[async_trait]
impl UnspentSource for FakeUnspent {
    async fn get_unspent(&self) -> Result<Vec<UnspentOutput>, CollaboratorError> {
        Ok(self.outputs.clone())
    }
}

#[derive(Default)]
pub struct FakeBroadcaster {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl FakeBroadcaster {
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, CollaboratorError> {
        let tx = Transaction::parse(raw_tx).map_err(|e| CollaboratorError::Rejected(e.to_string()))?;
        self.sent.lock().unwrap().push(raw_tx.to_vec());
        Ok(tx.txid())
    }
}

#[derive(Default)]
pub struct FakePeers {
    shared: Mutex<Vec<TxProposal>>,
}

impl FakePeers {
    pub fn shared(&self) -> Vec<TxProposal> {
        self.shared.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProposalNetwork for FakePeers {
    async fn send_proposal(&self, proposal: &TxProposal) -> Result<(), CollaboratorError> {
        self.shared.lock().unwrap().push(proposal.clone());
        Ok(())
    }
}

/// A funded wallet for copayer 1 with fake services around it
pub struct WalletHarness {
    pub wallet: Wallet,
    pub merchant: Arc<FakeMerchant>,
    pub broadcaster: Arc<FakeBroadcaster>,
    pub peers: Arc<FakePeers>,
}

pub fn wallet_harness(
    required: u8,
    total: u8,
    merchant: FakeMerchant,
    pki: &MerchantPki,
) -> WalletHarness {
    let keyring = Arc::new(test_keyring(required, total));
    let merchant = Arc::new(merchant);
    let broadcaster = Arc::new(FakeBroadcaster::default());
    let peers = Arc::new(FakePeers::default());
    let collaborators = Collaborators {
        unspent: Arc::new(FakeUnspent {
            outputs: funding(&keyring),
        }),
        broadcaster: broadcaster.clone(),
        merchant: merchant.clone(),
        peers: Some(peers.clone()),
    };

    let branch = copayer_branch(Network::Testnet, 1);
    let own_id = Copayer::new(branch.to_xpub()).id;
    let wallet = Wallet::new(
        WalletConfig::multisig(required, total, Network::Testnet),
        keyring,
        &own_id,
        collaborators,
        pki.trust_store(),
    )
    .unwrap()
    .with_signer(branch)
    .unwrap();

    WalletHarness {
        wallet,
        merchant,
        broadcaster,
        peers,
    }
}
