use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::error::DuhError;
use crate::provider::{ModelInfo, ModelProvider, TokenUsage};

/// Registry, routing, and cost accounting over a heterogeneous set of
/// `ModelProvider`s. Shared across a consensus session via `Arc`;
/// `record_usage` is the only mutating hot path and is serialized through
/// an internal mutex so the hard-limit check always observes a
/// consistent running total.
pub struct ProviderManager {
    cost_hard_limit: f64,
    providers: Mutex<HashMap<String, Arc<dyn ModelProvider>>>,
    models: Mutex<HashMap<String, ModelInfo>>,
    total_cost: Mutex<f64>,
    cost_by_provider: Mutex<HashMap<String, f64>>,
}

impl ProviderManager {
    pub fn new(cost_hard_limit: f64) -> Self {
        Self {
            cost_hard_limit,
            providers: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
            total_cost: Mutex::new(0.0),
            cost_by_provider: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a provider and indexes every model it reports.
    /// `Config` if `provider_id` is already present.
    pub fn register(&self, provider: Arc<dyn ModelProvider>) -> Result<(), DuhError> {
        let provider_id = provider.provider_id().to_string();
        let mut providers = self.providers.lock().unwrap();
        if providers.contains_key(&provider_id) {
            return Err(DuhError::Config(format!(
                "provider '{provider_id}' is already registered"
            )));
        }
        let mut models = self.models.lock().unwrap();
        for info in provider.list_models() {
            models.insert(info.model_ref(), info);
        }
        providers.insert(provider_id, provider);
        Ok(())
    }

    /// Removes a provider and every model it contributed to the index.
    /// `Config` if `provider_id` is not present — symmetric treatment
    /// with `register`'s error kind for provider-identity failures.
    pub fn unregister(&self, provider_id: &str) -> Result<(), DuhError> {
        let mut providers = self.providers.lock().unwrap();
        if providers.remove(provider_id).is_none() {
            return Err(DuhError::Config(format!(
                "provider '{provider_id}' is not registered"
            )));
        }
        let mut models = self.models.lock().unwrap();
        models.retain(|_, info| info.provider_id != provider_id);
        self.cost_by_provider.lock().unwrap().remove(provider_id);
        Ok(())
    }

    pub fn get_provider(&self, model_ref: &str) -> Result<(Arc<dyn ModelProvider>, String), DuhError> {
        let info = self
            .models
            .lock()
            .unwrap()
            .get(model_ref)
            .cloned()
            .ok_or_else(|| DuhError::ModelNotFound(model_ref.to_string()))?;
        let provider = self
            .providers
            .lock()
            .unwrap()
            .get(&info.provider_id)
            .cloned()
            .ok_or_else(|| DuhError::ModelNotFound(model_ref.to_string()))?;
        Ok((provider, info.model_id))
    }

    pub fn get_model_info(&self, model_ref: &str) -> Result<ModelInfo, DuhError> {
        self.models
            .lock()
            .unwrap()
            .get(model_ref)
            .cloned()
            .ok_or_else(|| DuhError::ModelNotFound(model_ref.to_string()))
    }

    pub fn list_all_models(&self) -> Vec<ModelInfo> {
        self.models.lock().unwrap().values().cloned().collect()
    }

    /// Computes and records the dollar cost of a call, enforcing the
    /// hard limit strictly-greater-than (not >=) so a call landing
    /// exactly on the limit is allowed.
    pub fn record_usage(&self, model_info: &ModelInfo, usage: &TokenUsage) -> Result<f64, DuhError> {
        let input_cost = (usage.input_tokens as f64 / 1_000_000.0) * model_info.input_cost_per_mtok;
        let output_cost = (usage.output_tokens as f64 / 1_000_000.0) * model_info.output_cost_per_mtok;
        let call_cost = input_cost + output_cost;

        let mut total = self.total_cost.lock().unwrap();
        *total += call_cost;
        let new_total = *total;
        drop(total);

        *self
            .cost_by_provider
            .lock()
            .unwrap()
            .entry(model_info.provider_id.clone())
            .or_insert(0.0) += call_cost;

        if self.cost_hard_limit > 0.0 && new_total > self.cost_hard_limit {
            return Err(DuhError::CostLimitExceeded {
                limit: self.cost_hard_limit,
                current: new_total,
            });
        }
        Ok(call_cost)
    }

    pub fn total_cost(&self) -> f64 {
        *self.total_cost.lock().unwrap()
    }

    pub fn cost_by_provider(&self) -> HashMap<String, f64> {
        self.cost_by_provider.lock().unwrap().clone()
    }

    pub fn reset_cost(&self) {
        *self.total_cost.lock().unwrap() = 0.0;
        self.cost_by_provider.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{model_info, MockProvider};

    fn manager_with_one_model(limit: f64) -> (ProviderManager, ModelInfo) {
        let info = model_info("p1", "m1", 1.0, 1.0, true);
        let provider = Arc::new(MockProvider::new("p1", vec![info.clone()]));
        let pm = ProviderManager::new(limit);
        pm.register(provider).unwrap();
        (pm, info)
    }

    #[test]
    fn duplicate_registration_is_config_error() {
        let (pm, info) = manager_with_one_model(0.0);
        let provider = Arc::new(MockProvider::new("p1", vec![info]));
        let err = pm.register(provider).unwrap_err();
        assert!(matches!(err, DuhError::Config(_)));
    }

    #[test]
    fn cost_limit_breach_reports_exact_current() {
        let (pm, info) = manager_with_one_model(0.05);
        let info = ModelInfo {
            input_cost_per_mtok: 0.03,
            output_cost_per_mtok: 0.03,
            ..info
        };
        let input_only = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        let output_only = TokenUsage {
            input_tokens: 0,
            output_tokens: 1_000_000,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        pm.record_usage(&info, &input_only).unwrap();
        let err = pm.record_usage(&info, &output_only).unwrap_err();
        match err {
            DuhError::CostLimitExceeded { limit, current } => {
                assert_eq!(limit, 0.05);
                assert!((current - 0.06).abs() < 1e-9);
            }
            _ => panic!("expected CostLimitExceeded"),
        }
    }

    #[test]
    fn unregister_unknown_provider_is_config_error() {
        let pm = ProviderManager::new(0.0);
        let err = pm.unregister("nope").unwrap_err();
        assert!(matches!(err, DuhError::Config(_)));
    }
}
