//! CLI commands for the wallet
//!
//! Implements all command handlers for the CLI interface.

use chrono::{TimeZone, Utc};
use rand::RngCore;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::WalletConfig;
use crate::core::{Address, Amount, Network};
use crate::crypto::ExtendedPrivKey;
use crate::multisig::{Copayer, KeyRing, SHARED_INDEX};
use crate::paypro::{
    verify_request, HttpTransport, PaymentDetails, PaymentProtocolClient, PaymentRequest,
    PaymentUri, ProtoMessage, VerifiedMerchant,
};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Shared P2SH address of an M-of-N wallet built from `xpubs`
pub fn shared_address(
    xpubs: &[String],
    required: u8,
    network: Network,
    index: u32,
    change: bool,
) -> CliResult<Address> {
    let ring = KeyRing::new(required, xpubs.len() as u8, network)?;
    for xpub in xpubs {
        ring.add_copayer_str(xpub)?;
    }
    Ok(ring.get_address(index, change, SHARED_INDEX)?)
}

/// Print a shared wallet address
pub fn cmd_address(
    xpubs: &[String],
    required: u8,
    network: Network,
    index: u32,
    change: bool,
) -> CliResult<()> {
    let address = shared_address(xpubs, required, network, index, change)?;

    println!("🏦 {}-of-{} wallet ({})", required, xpubs.len(), network);
    println!(
        "   {} address #{}: {}",
        if change { "Change" } else { "Receive" },
        index,
        address
    );
    Ok(())
}

/// Generate a random BIP45 branch key
pub fn cmd_keygen(network: Network) -> CliResult<()> {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let branch = ExtendedPrivKey::from_seed(network, &seed)?.bip45_branch()?;
    let xpub = branch.to_xpub();
    let copayer = Copayer::new(xpub.clone());

    println!("🔑 New copayer key ({})", network);
    println!("   xpub: {}", xpub);
    println!("   xprv: {}", branch);
    println!("   Copayer id: {}", copayer.id);
    println!();
    println!("   ⚠️  Keep the xprv secret. Share only the xpub.");
    Ok(())
}

/// Parse and print a `bitcoin:` URI
pub fn cmd_parse_uri(uri: &str) -> CliResult<()> {
    let parsed = PaymentUri::parse(uri)?;

    println!("🔗 Payment URI");
    if let Some(address) = &parsed.address {
        println!("   ├─ Address: {} ({})", address, address.network);
    }
    if let Some(amount) = parsed.amount {
        println!("   ├─ Amount: {} BTC", amount);
    }
    if let Some(label) = &parsed.label {
        println!("   ├─ Label: {}", label);
    }
    if let Some(message) = &parsed.message {
        println!("   ├─ Message: {}", message);
    }
    match &parsed.r {
        Some(r) => println!("   └─ Payment request: {}", r),
        None => println!("   └─ No payment request"),
    }
    Ok(())
}

/// Where `source` points for `inspect-request`: a URL or URI to fetch, or a file
fn request_url(source: &str) -> CliResult<Option<String>> {
    if PaymentUri::is_uri(source) {
        let uri = PaymentUri::parse(source)?;
        return match uri.r {
            Some(r) => Ok(Some(r)),
            None => Err(format!("{} has no payment request", source).into()),
        };
    }
    if source.starts_with("https://") || source.starts_with("http://") {
        return Ok(Some(source.to_string()));
    }
    Ok(None)
}

/// Decode, verify and print a payment request
///
/// `source` is a file holding a serialized PaymentRequest, a URL serving one,
/// or a `bitcoin:` URI with an `r` parameter.
pub fn cmd_inspect_request(source: &str, config: &WalletConfig) -> CliResult<()> {
    let trust = config.load_trust_store()?;

    let (request, details, merchant) = match request_url(source)? {
        Some(url) => {
            let transport = HttpTransport::new(config.http_timeout())?;
            let client = PaymentProtocolClient::new(
                Arc::new(transport),
                Arc::new(trust),
                config.network,
                config.allow_unsigned_requests,
            );
            let rt = tokio::runtime::Runtime::new()?;
            let fetched = rt.block_on(client.fetch_payment_request(&url))?;
            (fetched.request, fetched.details, Ok(fetched.merchant))
        }
        None => {
            let bytes = fs::read(Path::new(source))?;
            let request = PaymentRequest::decode(&bytes)?;
            let details = request.payment_details()?;
            let merchant = verify_request(
                &request,
                &trust,
                Utc::now().timestamp(),
                config.allow_unsigned_requests,
            );
            (request, details, merchant)
        }
    };

    print_request(&request, &details, merchant.as_ref().map_err(|e| e.to_string()));
    Ok(())
}

fn format_time(secs: u64) -> String {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn print_request(
    request: &PaymentRequest,
    details: &PaymentDetails,
    merchant: Result<&VerifiedMerchant, String>,
) {
    println!("🧾 Payment request (version {})", request.version());
    println!("   ├─ PKI: {}", request.pki_type_name());
    match merchant {
        Ok(merchant) => println!(
            "   ├─ Verified: {}",
            merchant.common_name.as_deref().unwrap_or("unsigned")
        ),
        Err(e) => println!("   ├─ ❌ Not verified: {}", e),
    }
    println!("   ├─ Network: {}", details.network_name());
    println!("   ├─ Created: {}", format_time(details.time));
    if let Some(expires) = details.expires {
        println!("   ├─ Expires: {}", format_time(expires));
    }
    if let Some(memo) = &details.memo {
        println!("   ├─ Memo: {}", memo);
    }
    if let Some(url) = &details.payment_url {
        println!("   ├─ Payment URL: {}", url);
    }

    let network = details.network().unwrap_or(Network::Livenet);
    println!("   └─ Outputs: {}", details.outputs.len());
    for output in &details.outputs {
        let to = Address::from_script(&output.script, network)
            .map(|a| a.to_string())
            .unwrap_or_else(|| output.script.to_hex());
        println!("      • {} BTC → {}", output.amount, to);
    }
    match details.total() {
        Some(total) => println!("      Total: {} BTC", Amount::from_sat(total)),
        None => println!("      Total: overflows"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{copayer_branch, test_keyring};

    #[test]
    fn test_shared_address_matches_keyring() {
        let xpubs: Vec<String> = (1..=3)
            .map(|seed| copayer_branch(Network::Testnet, seed).to_xpub().to_string())
            .collect();

        let address = shared_address(&xpubs, 2, Network::Testnet, 4, false).unwrap();
        let expected = test_keyring(2, 3).get_address(4, false, SHARED_INDEX).unwrap();
        assert_eq!(address, expected);
    }

    #[test]
    fn test_shared_address_bad_quorum() {
        let xpubs = vec![copayer_branch(Network::Testnet, 1).to_xpub().to_string()];
        assert!(shared_address(&xpubs, 2, Network::Testnet, 0, false).is_err());
    }

    #[test]
    fn test_request_url() {
        assert_eq!(
            request_url("bitcoin:?r=https://merchant.example/i/42").unwrap(),
            Some("https://merchant.example/i/42".to_string())
        );
        assert_eq!(
            request_url("https://merchant.example/i/42").unwrap(),
            Some("https://merchant.example/i/42".to_string())
        );
        assert_eq!(request_url("invoice.bin").unwrap(), None);
        assert!(request_url("bitcoin:1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH").is_err());
    }
}
