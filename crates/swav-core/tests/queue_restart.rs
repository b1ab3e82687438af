use ndarray::Array2;
use rand::Rng;
use swav_config::determinism;
use swav_core::queue::FeatureQueue;

fn seeded_batch(label: &str, rows: usize, cols: usize) -> Array2<f32> {
    let mut rng = determinism::rng_from_optional(None, label);
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0f32..1.0))
}

#[test]
fn snapshot_round_trips_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue0.json");

    let mut queue = FeatureQueue::zeros(2, 6, 4);
    for step in 0..4 {
        for slot in 0..2 {
            let batch = seeded_batch(&format!("restart/{slot}/{step}"), 3, 4);
            queue.advance(slot, batch.view()).unwrap();
        }
    }

    queue.save(&path).unwrap();
    let restored = FeatureQueue::load(&path).unwrap();
    assert_eq!(restored, queue, "reload must be byte-for-byte identical");
}

#[test]
fn missing_snapshot_is_not_an_error_at_setup() {
    use swav_core::collective::SingleProcess;
    use swav_core::config::SwavConfig;
    use swav_core::trainer::SwavTrainer;

    let dir = tempfile::tempdir().unwrap();
    let config = SwavConfig::from_toml_str(
        r#"
        num_samples = 16
        dataset = "stl10"
        feat_dim = 4
        nmb_prototypes = 4
        nmb_crops = [2]
        crops_for_assign = [0, 1]
        queue_length = 6
        epoch_queue_starts = 0
        "#,
    )
    .unwrap();

    let mut trainer = SwavTrainer::new(config, SingleProcess).unwrap();
    trainer.setup(dir.path()).unwrap();
    assert!(trainer.context().queue.is_none(), "fresh run starts without a queue");
}

#[test]
fn trainer_restart_reloads_the_persisted_queue() {
    use ndarray::{concatenate, ArrayView2, Axis};
    use swav_core::collective::SingleProcess;
    use swav_core::config::SwavConfig;
    use swav_core::trainer::{Backbone, SwavTrainer};
    use swav_core::{Result, SwavError};

    struct LinearHead {
        prototypes: Array2<f32>,
    }

    impl Backbone for LinearHead {
        fn forward(
            &mut self,
            crops: &[ArrayView2<'_, f32>],
        ) -> Result<(Array2<f32>, Array2<f32>)> {
            let embeddings =
                concatenate(Axis(0), crops).map_err(|err| SwavError::Shape(err.to_string()))?;
            let logits = embeddings.dot(&self.prototypes.t());
            Ok((embeddings, logits))
        }

        fn prototype_weights(&self) -> &Array2<f32> {
            &self.prototypes
        }

        fn prototype_weights_mut(&mut self) -> &mut Array2<f32> {
            &mut self.prototypes
        }

        fn gradients_mut(&mut self) -> Vec<(&str, &mut Option<Array2<f32>>)> {
            Vec::new()
        }
    }

    let config = SwavConfig::from_toml_str(
        r#"
        num_samples = 16
        dataset = "cifar10"
        feat_dim = 4
        nmb_prototypes = 5
        nmb_crops = [2]
        crops_for_assign = [0, 1]
        queue_length = 6
        epoch_queue_starts = 0
        "#,
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut backbone = LinearHead {
        prototypes: seeded_batch("restart/prototypes", 5, 4),
    };

    let saved = {
        let mut trainer = SwavTrainer::new(config.clone(), SingleProcess).unwrap();
        trainer.setup(dir.path()).unwrap();
        trainer.on_epoch_start(2).unwrap();
        for step in 0..2 {
            let crops: Vec<Array2<f32>> = (0..2)
                .map(|crop| seeded_batch(&format!("restart/crop{crop}/{step}"), 3, 4))
                .collect();
            let views: Vec<_> = crops.iter().map(|c| c.view()).collect();
            trainer.training_step(&mut backbone, &views).unwrap();
        }
        trainer.on_epoch_end().unwrap();
        trainer.context().queue.clone().expect("queue active")
    };

    let mut resumed = SwavTrainer::new(config, SingleProcess).unwrap();
    resumed.setup(dir.path()).unwrap();
    let reloaded = resumed.context().queue.as_ref().expect("snapshot restored");
    assert_eq!(*reloaded, saved);
}
