//! Firewall Manager
//!
//! Keeps rules in the order they were added and forwards them to a
//! [`FirewallAgent`] while enabled. While disabled, every change is only
//! remembered; enabling applies the remembered rules in order.

use super::{FirewallAgent, FirewallError, FirewallService, Rule};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Ordered, name-keyed rule store backed by a [`FirewallAgent`]
pub struct FirewallManager {
    agent: Arc<dyn FirewallAgent>,
    rules: Mutex<Vec<Rule>>,
    enabled: AtomicBool,
}

impl FirewallManager {
    /// Create a new manager
    pub fn new(agent: Arc<dyn FirewallAgent>, enabled: bool) -> Self {
        Self {
            agent,
            rules: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Names of the remembered rules, in application order
    pub async fn rule_names(&self) -> Vec<String> {
        self.rules.lock().await.iter().map(|r| r.name.clone()).collect()
    }

    /// Look up a remembered rule by name
    pub async fn get(&self, name: &str) -> Option<Rule> {
        self.rules.lock().await.iter().find(|r| r.name == name).cloned()
    }
}

#[async_trait]
impl FirewallService for FirewallManager {
    async fn add(&self, rules: Vec<Rule>) -> Result<(), FirewallError> {
        let mut current = self.rules.lock().await;

        {
            let mut names = HashSet::new();
            for rule in &rules {
                if rule.name.is_empty() {
                    return Err(FirewallError::RuleWithoutName);
                }
                if current.iter().any(|r| r.name == rule.name) || !names.insert(rule.name.as_str())
                {
                    return Err(FirewallError::RuleAlreadyExists(rule.name.clone()));
                }
            }
        }

        if self.is_enabled() {
            for (i, rule) in rules.iter().enumerate() {
                if let Err(e) = self.agent.add(rule).await {
                    // keep the batch atomic
                    for applied in rules[..i].iter().rev() {
                        if let Err(e) = self.agent.delete(applied).await {
                            warn!(rule = %applied.name, "failed to roll back rule: {}", e);
                        }
                    }
                    return Err(e);
                }
            }
        }

        for rule in rules {
            debug!(rule = %rule.name, "firewall rule added");
            current.push(rule);
        }
        Ok(())
    }

    async fn delete(&self, names: &[String]) -> Result<(), FirewallError> {
        let mut current = self.rules.lock().await;
        for name in names {
            let Some(index) = current.iter().position(|r| &r.name == name) else {
                continue;
            };
            if self.is_enabled() {
                self.agent.delete(&current[index]).await?;
            }
            current.remove(index);
            debug!(rule = %name, "firewall rule deleted");
        }
        Ok(())
    }

    async fn enable(&self) -> Result<(), FirewallError> {
        let current = self.rules.lock().await;
        if self.is_enabled() {
            return Ok(());
        }
        for rule in current.iter() {
            self.agent.add(rule).await?;
        }
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    async fn disable(&self) -> Result<(), FirewallError> {
        let current = self.rules.lock().await;
        if !self.is_enabled() {
            return Ok(());
        }
        for rule in current.iter().rev() {
            self.agent.delete(rule).await?;
        }
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    async fn flush(&self) -> Result<(), FirewallError> {
        let mut current = self.rules.lock().await;
        if self.is_enabled() {
            for rule in current.iter().rev() {
                self.agent.delete(rule).await?;
            }
        }
        current.clear();
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}
