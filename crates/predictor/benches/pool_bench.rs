//! Benchmarks for pooled prediction.
//! Run with: cargo bench -p decision-predictor

use decision_predictor::{LinearPolicyEngine, PooledPredictor};
use serde_json::json;
use std::sync::Arc;
use std::thread;

const NUM_ACTIONS: usize = 16;
const FEATURE_DIM: usize = 64;

fn model_bytes(version: &str) -> Vec<u8> {
    let weights: Vec<Vec<f32>> = (0..NUM_ACTIONS)
        .map(|a| {
            (0..FEATURE_DIM)
                .map(|f| ((a * 7 + f * 13) as f32 % 100.0 - 50.0) / 500.0)
                .collect()
        })
        .collect();
    serde_json::to_vec(&json!({
        "version": version,
        "num_actions": NUM_ACTIONS,
        "feature_dim": FEATURE_DIM,
        "weights": weights,
        "epsilon": 0.1
    }))
    .expect("model serializes")
}

fn main() {
    let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let predictor = Arc::new(PooledPredictor::new(Arc::new(LinearPolicyEngine), threads));
    predictor
        .update_model(&model_bytes("bench-1"))
        .expect("model loads");

    let context = json!({
        "features": (0..FEATURE_DIM).map(|i| i as f32 * 0.01).collect::<Vec<_>>()
    });

    // Warmup
    for _ in 0..100 {
        predictor.predict(&context).expect("predict");
    }

    // Single-threaded
    let iterations = 100_000u32;
    let start = std::time::Instant::now();
    for _ in 0..iterations {
        let _ = predictor.predict(&context).expect("predict");
    }
    let elapsed = start.elapsed();

    println!("=== Pooled Prediction Benchmark ===");
    println!("Iterations:  {}", iterations);
    println!("Total time:  {:?}", elapsed);
    println!("Per call:    {:?}", elapsed / iterations);
    println!(
        "Throughput:  {:.0} predictions/sec",
        iterations as f64 / elapsed.as_secs_f64()
    );

    // Contended, with a model swap midway
    let per_thread = iterations / threads as u32;
    let start = std::time::Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let predictor = Arc::clone(&predictor);
            let context = context.clone();
            thread::spawn(move || {
                for _ in 0..per_thread {
                    let _ = predictor.predict(&context).expect("predict");
                }
            })
        })
        .collect();
    predictor
        .update_model(&model_bytes("bench-2"))
        .expect("model swaps");
    for h in handles {
        h.join().expect("bench thread");
    }
    let elapsed = start.elapsed();

    println!("Threads:     {}", threads);
    println!(
        "Contended:   {:.0} predictions/sec",
        (per_thread * threads as u32) as f64 / elapsed.as_secs_f64()
    );
}
