use std::sync::Arc;

use kms_keymanager::prelude::*;
use kms_keymanager::{InMemoryBackend, InMemoryConnector};
use sha2::{Digest, Sha256};

const CONFIG: &str = r#"{
    "access_key_id": "AKIDEXAMPLE",
    "secret_access_key": "demo-secret",
    "region": "us-west-2",
    "deletion_window_days": 7
}"#;

#[tokio::main]
async fn main() -> KmsResult<()> {
    println!("Testing KMS key manager against the in-memory backend...");

    let backend = Arc::new(InMemoryBackend::new());
    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let cancel = CancellationToken::new();

    let report = manager.configure(CONFIG, &cancel).await?;
    println!("Configured: {} backend keys examined", report.examined);

    let first = manager.generate_key("x509-CA-A", KeyType::EcP256, &cancel).await?;
    println!("Generated {} ({}), fingerprint {}", first.id, first.key_type, first.fingerprint());

    let digest = Sha256::digest(b"Hello, KMS!");
    let signature = manager
        .sign_data("x509-CA-A", &digest, &SignerOpts::default(), &cancel)
        .await?;
    println!("Signature created: {} bytes", signature.len());

    let rotated = manager.generate_key("x509-CA-A", KeyType::EcP256, &cancel).await?;
    println!("Rotated {}, new fingerprint {}", rotated.id, rotated.fingerprint());
    println!("Backend deletion requests: {:?}", backend.deletion_requests());

    match manager
        .sign_data("unknown-id", &digest, &SignerOpts::default(), &cancel)
        .await
    {
        Ok(_) => println!("✗ Signing with an unknown key should have failed!"),
        Err(e) => println!("✓ Unknown key rejected: {}", e.user_friendly_message()),
    }

    // The in-memory backend hands out stand-in key bytes, not SubjectPublicKeyInfo,
    // so only fingerprints are shown
    for key in manager.get_public_keys()? {
        println!(
            "Current key {} ({}): {} stand-in bytes, fingerprint {}",
            key.id,
            key.key_type,
            key.pkix_data.len(),
            key.fingerprint()
        );
    }

    Ok(())
}
