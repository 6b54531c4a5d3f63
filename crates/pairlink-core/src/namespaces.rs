//! Namespace model and settlement conformance checking.
//!
//! A namespace is a chain-scoped bundle of methods, events, and accounts
//! negotiated between peers. Proposers send required (and optionally
//! desired) namespaces; responders answer with settled namespaces carrying
//! concrete accounts. Settlement only succeeds when the settled set covers
//! every required chain, method, and event; partial acceptance is treated
//! as rejection of the whole proposal.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{PairlinkError, PairlinkResult};

/// Namespace requirements sent by the proposer, keyed by namespace id
/// (e.g. `eip155`)
pub type ProposedNamespaces = BTreeMap<String, ProposedNamespace>;

/// Namespaces settled by the responder, keyed by namespace id
pub type SettledNamespaces = BTreeMap<String, SettledNamespace>;

/// One proposed namespace: the chains, methods, and events the proposer
/// wants access to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedNamespace {
    /// CAIP-2 chain ids (e.g. `eip155:1`)
    pub chains: Vec<String>,
    /// JSON-RPC methods the proposer intends to call
    pub methods: Vec<String>,
    /// Events the proposer wants to receive
    pub events: Vec<String>,
}

/// One settled namespace: the accounts, methods, and events the responder
/// actually granted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledNamespace {
    /// CAIP-10 accounts (e.g. `eip155:1:0xabc`)
    pub accounts: Vec<String>,
    /// Granted methods
    pub methods: Vec<String>,
    /// Granted events
    pub events: Vec<String>,
}

impl SettledNamespace {
    /// Chain ids covered by this namespace's accounts (`chain:reference`
    /// prefix of each CAIP-10 account)
    pub fn chains(&self) -> Vec<String> {
        let chains: BTreeSet<String> = self
            .accounts
            .iter()
            .filter_map(|account| {
                let mut parts = account.splitn(3, ':');
                let ns = parts.next()?;
                let reference = parts.next()?;
                parts.next()?;
                Some(format!("{}:{}", ns, reference))
            })
            .collect();
        chains.into_iter().collect()
    }
}

/// Check that `settled` conforms to `required`.
///
/// For every required namespace: it must be present in the settled set, its
/// settled methods/events must be supersets of the required ones, and every
/// required chain must be backed by at least one settled account. Any gap
/// rejects the whole proposal (`NamespacesMismatch`); there is no partial
/// acceptance.
pub fn assert_conforms(
    required: &ProposedNamespaces,
    settled: &SettledNamespaces,
) -> PairlinkResult<()> {
    for (name, proposed) in required {
        let granted = settled.get(name).ok_or_else(|| {
            PairlinkError::NamespacesMismatch(format!("namespace {} not settled", name))
        })?;

        for method in &proposed.methods {
            if !granted.methods.contains(method) {
                return Err(PairlinkError::NamespacesMismatch(format!(
                    "method {} missing from settled namespace {}",
                    method, name
                )));
            }
        }

        for event in &proposed.events {
            if !granted.events.contains(event) {
                return Err(PairlinkError::NamespacesMismatch(format!(
                    "event {} missing from settled namespace {}",
                    event, name
                )));
            }
        }

        let settled_chains = granted.chains();
        for chain in &proposed.chains {
            if !settled_chains.contains(chain) {
                return Err(PairlinkError::NamespacesMismatch(format!(
                    "chain {} has no settled account in namespace {}",
                    chain, name
                )));
            }
        }
    }

    Ok(())
}

/// Whether `method` is granted by any settled namespace, optionally scoped
/// to a chain id
pub fn is_method_authorized(
    settled: &SettledNamespaces,
    method: &str,
    chain_id: Option<&str>,
) -> bool {
    settled.values().any(|ns| {
        let method_ok = ns.methods.iter().any(|m| m == method);
        match chain_id {
            Some(chain) => method_ok && ns.chains().iter().any(|c| c == chain),
            None => method_ok,
        }
    })
}

/// Whether `event` is granted by any settled namespace
pub fn is_event_authorized(settled: &SettledNamespaces, event: &str) -> bool {
    settled.values().any(|ns| ns.events.iter().any(|e| e == event))
}
