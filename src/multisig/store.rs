//! Proposal store
//!
//! Owns every proposal of the session. Mutations of one proposal are
//! serialized through its own lock while different proposals proceed in
//! parallel.

use secp256k1::SecretKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::core::Txid;
use crate::multisig::proposal::{ProposalError, ProposalState, TxProposal};

type Slot = Arc<Mutex<TxProposal>>;

/// Session store of transaction proposals
#[derive(Debug, Default)]
pub struct TxProposalStore {
    proposals: RwLock<HashMap<String, Slot>>,
}

impl TxProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: &str) -> Result<Slot, ProposalError> {
        self.proposals
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProposalError::NotFound(id.to_string()))
    }

    /// Store a proposal, returning its id; an existing proposal with the
    /// same id is merged instead of replaced
    pub async fn insert(&self, proposal: TxProposal) -> Result<String, ProposalError> {
        let id = proposal.id.clone();
        let existing = {
            let mut proposals = self.proposals.write().await;
            match proposals.get(&id) {
                Some(slot) => Some(slot.clone()),
                None => {
                    proposals.insert(id.clone(), Arc::new(Mutex::new(proposal.clone())));
                    None
                }
            }
        };

        if let Some(slot) = existing {
            slot.lock().await.merge(&proposal)?;
        } else {
            log::info!("Stored proposal {}", id);
        }
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<TxProposal> {
        let slot = self.slot(id).await.ok()?;
        let proposal = slot.lock().await.clone();
        Some(proposal)
    }

    pub async fn list(&self) -> Vec<TxProposal> {
        let slots: Vec<Slot> = self.proposals.read().await.values().cloned().collect();
        let mut proposals = Vec::with_capacity(slots.len());
        for slot in slots {
            proposals.push(slot.lock().await.clone());
        }
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        proposals
    }

    /// Proposals still collecting signatures
    pub async fn pending_count(&self) -> usize {
        self.list()
            .await
            .iter()
            .filter(|p| p.state == ProposalState::Pending)
            .count()
    }

    /// Sign a proposal on a blocking worker while holding its lock
    pub async fn sign(
        &self,
        id: &str,
        copayer_id: &str,
        keys: Vec<SecretKey>,
    ) -> Result<ProposalState, ProposalError> {
        let mut guard = self.slot(id).await?.lock_owned().await;
        let copayer_id = copayer_id.to_string();

        tokio::task::spawn_blocking(move || guard.sign(&copayer_id, &keys))
            .await
            .map_err(|e| ProposalError::Worker(e.to_string()))?
    }

    /// Merge a copy received from another copayer
    pub async fn merge(&self, remote: TxProposal) -> Result<ProposalState, ProposalError> {
        let id = self.insert(remote).await?;
        let slot = self.slot(&id).await?;
        let state = slot.lock().await.state;
        Ok(state)
    }

    pub async fn reject(&self, id: &str, copayer_id: &str) -> Result<ProposalState, ProposalError> {
        let slot = self.slot(id).await?;
        let mut proposal = slot.lock().await;
        proposal.reject(copayer_id)
    }

    pub async fn mark_broadcast(&self, id: &str, txid: Txid) -> Result<(), ProposalError> {
        let slot = self.slot(id).await?;
        let mut proposal = slot.lock().await;
        proposal.mark_broadcast(txid)?;
        log::info!("Proposal {} broadcast as {}", id, txid);
        Ok(())
    }

    /// Claim a fully signed proposal for delivery, returning the claimed copy
    ///
    /// A second claim fails with `Closed(Sending)` until the first one is
    /// finished with [`mark_broadcast`](Self::mark_broadcast) or given up
    /// with [`abort_send`](Self::abort_send).
    pub async fn begin_send(&self, id: &str) -> Result<TxProposal, ProposalError> {
        let slot = self.slot(id).await?;
        let mut proposal = slot.lock().await;
        proposal.begin_send()?;
        log::debug!("Sending proposal {}", id);
        Ok(proposal.clone())
    }

    pub async fn abort_send(&self, id: &str) {
        if let Ok(slot) = self.slot(id).await {
            slot.lock().await.abort_send();
            log::debug!("Sending proposal {} aborted", id);
        }
    }

    pub async fn remove(&self, id: &str) -> Option<TxProposal> {
        let slot = self.proposals.write().await.remove(id)?;
        let proposal = slot.lock().await.clone();
        Some(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{proposal_fixture, shared_keys};

    #[tokio::test]
    async fn test_insert_get_list() {
        let store = TxProposalStore::new();
        let (_ring, proposal) = proposal_fixture(2, 3);

        let id = store.insert(proposal.clone()).await.unwrap();
        assert_eq!(id, proposal.id);
        assert_eq!(store.get(&id).await.unwrap().id, id);
        assert_eq!(store.list().await.len(), 1);
        assert_eq!(store.pending_count().await, 1);
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_sign_unknown_proposal() {
        let store = TxProposalStore::new();
        assert_eq!(
            store.sign("nope", "copayer", vec![]).await,
            Err(ProposalError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_signatures_are_serialized() {
        let store = Arc::new(TxProposalStore::new());
        let (ring, proposal) = proposal_fixture(3, 3);
        let id = store.insert(proposal).await.unwrap();
        let ids: Vec<String> = ring.copayers().into_iter().map(|c| c.id).collect();

        let tasks = ids.iter().map(|copayer| {
            let store = store.clone();
            let id = id.clone();
            let copayer = copayer.clone();
            let keys = shared_keys(&ring, &copayer);
            async move { store.sign(&id, &copayer, keys).await }
        });
        let results = futures::future::join_all(tasks).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.state, ProposalState::FullySigned);
        assert_eq!(stored.signed_by.len(), 3);
        assert_eq!(stored.builder().signature_count(0), 3);
    }

    #[tokio::test]
    async fn test_merge_remote_copy() {
        let store = TxProposalStore::new();
        let (ring, proposal) = proposal_fixture(2, 3);
        let ids: Vec<String> = ring.copayers().into_iter().map(|c| c.id).collect();
        let id = store.insert(proposal.clone()).await.unwrap();

        store
            .sign(&id, &ids[0], shared_keys(&ring, &ids[0]))
            .await
            .unwrap();

        let mut remote = proposal;
        remote.sign(&ids[1], &shared_keys(&ring, &ids[1])).unwrap();
        assert_eq!(
            store.merge(remote).await.unwrap(),
            ProposalState::FullySigned
        );
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_reject_and_remove() {
        let store = TxProposalStore::new();
        let (ring, proposal) = proposal_fixture(1, 2);
        let ids: Vec<String> = ring.copayers().into_iter().map(|c| c.id).collect();
        let id = store.insert(proposal).await.unwrap();

        // 1-of-2 tolerates one rejection
        assert_eq!(
            store.reject(&id, &ids[0]).await.unwrap(),
            ProposalState::Pending
        );
        assert_eq!(
            store.reject(&id, &ids[1]).await.unwrap(),
            ProposalState::Rejected
        );
        assert!(store.remove(&id).await.is_some());
        assert!(store.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_requires_full_signatures() {
        let store = TxProposalStore::new();
        let (_ring, proposal) = proposal_fixture(2, 3);
        let id = store.insert(proposal).await.unwrap();
        assert_eq!(
            store.mark_broadcast(&id, Txid::default()).await,
            Err(ProposalError::NotFullySigned)
        );
    }

    #[tokio::test]
    async fn test_only_one_send_claim() {
        let store = Arc::new(TxProposalStore::new());
        let (ring, proposal) = proposal_fixture(1, 1);
        let ids: Vec<String> = ring.copayers().into_iter().map(|c| c.id).collect();
        let id = store.insert(proposal).await.unwrap();
        store
            .sign(&id, &ids[0], shared_keys(&ring, &ids[0]))
            .await
            .unwrap();

        let claims = (0..4).map(|_| {
            let store = store.clone();
            let id = id.clone();
            async move { store.begin_send(&id).await }
        });
        let results = futures::future::join_all(claims).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == ProposalError::Closed(ProposalState::Sending)));

        store.abort_send(&id).await;
        assert_eq!(
            store.get(&id).await.unwrap().state,
            ProposalState::FullySigned
        );
    }
}
