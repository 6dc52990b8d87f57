use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

// ============================================================================
// Component Health
// ============================================================================
//
// Components report their own status; the overall status is the worst one
// reported. Served as JSON on /health.
//
// ============================================================================

pub const CONSUMER: &str = "consumer";
pub const DATABASE: &str = "database";

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    components: RwLock<HashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, component: &str, status: HealthStatus) {
        let mut components = self.components.write().await;

        let changed = components
            .get(component)
            .is_none_or(|previous| previous.status != status);
        if changed {
            match &status {
                HealthStatus::Healthy => tracing::info!(component, "Component healthy"),
                HealthStatus::Degraded(reason) => {
                    tracing::warn!(component, reason = %reason, "Component degraded")
                }
                HealthStatus::Unhealthy(reason) => {
                    tracing::error!(component, reason = %reason, "Component unhealthy")
                }
            }
        }

        components.insert(
            component.to_string(),
            ComponentHealth {
                status,
                last_check: Utc::now(),
            },
        );
    }

    pub async fn snapshot(&self) -> SystemHealth {
        let components = self.components.read().await.clone();

        SystemHealth {
            overall_status: compute_overall_status(&components),
            components,
            check_time: Utc::now(),
        }
    }
}

fn compute_overall_status(components: &HashMap<String, ComponentHealth>) -> HealthStatus {
    let mut has_degraded = false;
    let mut unhealthy_components = Vec::new();

    for (name, health) in components {
        match &health.status {
            HealthStatus::Unhealthy(msg) => {
                unhealthy_components.push(format!("{}: {}", name, msg));
            }
            HealthStatus::Degraded(_) => {
                has_degraded = true;
            }
            HealthStatus::Healthy => {}
        }
    }

    if !unhealthy_components.is_empty() {
        unhealthy_components.sort();
        HealthStatus::Unhealthy(unhealthy_components.join(", "))
    } else if has_degraded {
        HealthStatus::Degraded("Some components degraded".to_string())
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.snapshot().await.overall_status.is_healthy());
    }

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let registry = HealthRegistry::new();
        registry.update(DATABASE, HealthStatus::Healthy).await;
        registry
            .update(CONSUMER, HealthStatus::Degraded("broker read exhausted".into()))
            .await;

        let health = registry.snapshot().await;
        assert!(matches!(health.overall_status, HealthStatus::Degraded(_)));

        registry
            .update(DATABASE, HealthStatus::Unhealthy("pool closed".into()))
            .await;
        let health = registry.snapshot().await;
        assert_eq!(
            health.overall_status,
            HealthStatus::Unhealthy("database: pool closed".into())
        );
    }

    #[tokio::test]
    async fn test_recovery_returns_to_healthy() {
        let registry = HealthRegistry::new();
        registry
            .update(CONSUMER, HealthStatus::Degraded("stalled".into()))
            .await;
        registry.update(CONSUMER, HealthStatus::Healthy).await;

        let health = registry.snapshot().await;
        assert!(health.overall_status.is_healthy());
        assert_eq!(health.components.len(), 1);
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let json = serde_json::to_value(HealthStatus::Degraded("slow".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "degraded", "reason": "slow"}));

        let json = serde_json::to_value(HealthStatus::Healthy).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy"}));
    }
}
