use std::sync::Arc;

use duh::config::DuhConfig;
use duh::provider::mock::{model_info, MockProvider};
use duh::{run_consensus, ProviderManager};

fn three_model_panel(responses: [&str; 2]) -> Arc<ProviderManager> {
    let pm = ProviderManager::new(0.0);
    for (idx, id) in ["p1", "p2", "p3"].into_iter().enumerate() {
        let model = format!("m{}", idx + 1);
        let provider = Arc::new(MockProvider::new(id, vec![model_info(id, &model, 1.0, 1.0, true)]));
        provider.queue_responses(&model, responses.iter().map(|s| s.to_string()).collect());
        pm.register(provider).unwrap();
    }
    Arc::new(pm)
}

#[tokio::test]
async fn consensus_session_reaches_a_decision() {
    let pm = three_model_panel(["initial answer", "revised answer"]);
    let config = DuhConfig::default();

    let outcome = run_consensus("is this a good design?", &config, pm, None, None, None).await.unwrap();

    assert!(!outcome.decision.is_empty());
    assert!(outcome.confidence > 0.0);
    assert!(outcome.rounds_used >= 1 && outcome.rounds_used <= config.general.max_rounds);
}

#[tokio::test]
async fn insufficient_models_is_reported_as_a_typed_error() {
    let pm = Arc::new(ProviderManager::new(0.0));
    let config = DuhConfig::default();

    let err = run_consensus("anything?", &config, pm, None, None, None).await.unwrap_err();
    assert!(matches!(err, duh::DuhError::InsufficientModels(_)));
}
