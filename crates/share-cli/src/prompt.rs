//! Terminal questions. Reads happen on the blocking pool so the runtime
//! keeps servicing the connection while a human thinks.

use anyhow::{bail, Result};
use async_trait::async_trait;
use mdns_core::PeerAdvertisement;
use share_core::{short_fingerprint, PeerSummary, TrustPrompt};
use std::io::{self, Write};
use transport_quic::Sas;

async fn read_answer(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        print!("{} ", question);
        io::stdout().flush().ok()?;
        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(input.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Yes/no question; anything but an explicit yes (including EOF) is no.
pub async fn ask(question: &str) -> bool {
    read_answer(format!("{} [y/N]:", question))
        .await
        .map(|a| is_yes(&a))
        .unwrap_or(false)
}

/// Let the user choose one of the discovered peers.
pub async fn pick_peer(peers: &[PeerAdvertisement]) -> Result<usize> {
    println!("Discovered {} receiver(s):", peers.len());
    for (i, p) in peers.iter().enumerate() {
        println!(
            "  [{}] {} fp={}",
            i + 1,
            p.display_label(),
            p.fingerprint().map(short_fingerprint).unwrap_or_default()
        );
    }
    let Some(answer) = read_answer(format!("Send to which receiver? [1-{}]:", peers.len())).await
    else {
        bail!("no receiver chosen");
    };
    match answer.parse::<usize>() {
        Ok(n) if (1..=peers.len()).contains(&n) => Ok(n - 1),
        _ => bail!("invalid choice {:?}", answer),
    }
}

/// Shows the SAS and asks whether the receiver displays the same words.
pub struct StdinPrompt;

#[async_trait]
impl TrustPrompt for StdinPrompt {
    async fn confirm(&self, peer: &PeerSummary, sas: &Sas) -> share_core::Result<bool> {
        println!();
        println!("First contact with {}", peer.label);
        println!("  Fingerprint: {}", short_fingerprint(&peer.fp));
        println!("  SAS:         {}", sas);
        let trusted = ask("Does the receiver show the same words?").await;
        if !trusted {
            tracing::warn!(peer = %peer.label, "SAS declined");
        }
        Ok(trusted)
    }
}
