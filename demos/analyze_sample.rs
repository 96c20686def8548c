//! Analyze a synthetic region and print the API payload

use pulse_index::encoder::AnalysisEncoder;
use pulse_index::{BehaviorPipeline, PipelineConfig, SourcesAdapter};

fn main() {
    let days: Vec<String> = (1..=28).map(|d| format!("2024-02-{d:02}")).collect();
    let series = |f: &dyn Fn(usize) -> f64| -> String {
        days.iter()
            .enumerate()
            .map(|(i, day)| format!(r#"{{ "timestamp": "{day}", "value": {:.3} }}"#, f(i)))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let json = format!(
        r#"{{
        "schema_version": "pulse.sources.v1",
        "region": {{ "id": "demo", "name": "Demo Region" }},
        "sources": [
            {{ "name": "market_volatility", "cadence": "daily", "points": [{}] }},
            {{ "name": "mobility", "cadence": "daily", "points": [{}] }},
            {{ "name": "search_interest", "cadence": "daily", "points": [{}] }},
            {{ "name": "health_risk", "unavailable": "upstream timeout" }}
        ]
    }}"#,
        series(&|i| 0.35 + i as f64 * 0.01),
        series(&|i| if i < 21 { 0.7 } else { 0.35 }),
        series(&|i| 0.4 + (i % 5) as f64 * 0.02),
    );

    let result = SourcesAdapter::parse_document(&json).and_then(|document| {
        let pipeline = BehaviorPipeline::new(PipelineConfig::default())?;
        let analysis = pipeline.analyze_document(&document)?;
        AnalysisEncoder::new().encode_to_json_pretty(&analysis)
    });

    match result {
        Ok(payload) => println!("{payload}"),
        Err(e) => eprintln!("Error: {e:?}"),
    }
}
