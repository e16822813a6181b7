//! Backpressure fuzz tests
//!
//! Randomized link capacities and a randomly stalling consumer must never
//! change the order or content of emitted samples relative to an
//! unthrottled run.

use kc705_pipeline::block::{conv_stages, BuildContext, InvertedResidual};
use kc705_pipeline::linear::Classifier;
use kc705_pipeline::pool::GlobalAvgPool;
use kc705_pipeline::{
    FeatureMap, Layout, ModelConfig, ModelWeights, Pipeline, Sample, SaturationCounter, Stage,
    Token, WeightSet,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Every stage of the tiny model, built directly rather than through the sequencer.
fn model_stages(config: &ModelConfig, weights: &ModelWeights) -> Vec<Box<dyn Stage>> {
    let ctx = BuildContext::new(config, SaturationCounter::new());
    let layers = weights.layers();
    let mut stages: Vec<Box<dyn Stage>> = Vec::new();

    let WeightSet::Stem(stem) = &layers[0] else { panic!("stem") };
    let (built, mut shape) = conv_stages("stem", config.stem(), config.input(), stem, &ctx).unwrap();
    stages.extend(built);

    for (i, block) in config.blocks().iter().enumerate() {
        let WeightSet::Block(w) = &layers[i + 1] else { panic!("block") };
        let stage = InvertedResidual::new(format!("b{i}"), block, shape, w, &ctx).unwrap();
        shape = stage.output().shape;
        stages.push(Box::new(stage));
    }

    let WeightSet::Head(head) = &layers[layers.len() - 2] else { panic!("head") };
    let (built, shape) = conv_stages("head", config.head(), shape, head, &ctx).unwrap();
    stages.extend(built);
    stages.push(Box::new(GlobalAvgPool::new("pool", shape, ctx.fx.clone())));

    let WeightSet::Classifier(fc) = &layers[layers.len() - 1] else { panic!("classifier") };
    stages.push(Box::new(
        Classifier::new("fc", shape.channels, fc.clone(), ctx.weight_format, ctx.fx.clone(), 3)
            .unwrap(),
    ));
    stages
}

fn random_image(config: &ModelConfig, rng: &mut StdRng) -> FeatureMap {
    let shape = config.input();
    let data = (0..shape.volume())
        .map(|_| Sample::from_raw(rng.gen_range(-300..300)))
        .collect();
    FeatureMap::from_samples(shape, data).unwrap()
}

/// Feed and drain at random, with every link sized at random.
fn throttled_run(
    stages: Vec<Box<dyn Stage>>,
    frames: &[FeatureMap],
    rng: &mut StdRng,
) -> Vec<Token> {
    let capacities: Vec<usize> = (0..=stages.len()).map(|_| rng.gen_range(1..4)).collect();
    let mut pipe = Pipeline::with_link_capacities(stages, |i| capacities[i]).unwrap();
    let layout = pipe.input().layout;
    let mut input: Vec<Token> = frames.iter().flat_map(|f| f.tokens(layout)).collect();
    input.reverse();
    let expected_frames = frames.len();

    let mut output = Vec::new();
    let mut frames_seen = 0;
    let mut idle_rounds = 0;
    while frames_seen < expected_frames {
        let mut fed = false;
        if rng.gen_bool(0.6) {
            if let Some(&token) = input.last() {
                if pipe.try_feed(token).is_ok() {
                    input.pop();
                    fed = true;
                }
            }
        }
        let moved = pipe.step().unwrap() || fed;
        let mut drained = false;
        if rng.gen_bool(0.4) {
            for _ in 0..rng.gen_range(1..3) {
                if let Some(token) = pipe.try_drain() {
                    drained = true;
                    frames_seen += usize::from(token.last);
                    output.push(token);
                }
            }
        }
        idle_rounds = if moved || drained { 0 } else { idle_rounds + 1 };
        assert!(idle_rounds < 1_000, "pipeline made no progress");
    }
    assert!(pipe.try_drain().is_none());
    assert!(pipe.is_quiescent());
    output
}

#[test]
fn test_random_backpressure_preserves_order() {
    let config = ModelConfig::tiny(10);
    let weights = ModelWeights::random(&config, 99);

    for seed in [1u64, 2, 3] {
        let mut rng = StdRng::seed_from_u64(seed);
        let frames = [random_image(&config, &mut rng), random_image(&config, &mut rng)];

        let mut reference = Pipeline::new(model_stages(&config, &weights), 1 << 16).unwrap();
        let mut expected = Vec::new();
        for frame in &frames {
            let out = reference.run_frame(frame).unwrap();
            expected.extend(out.tokens(Layout::ChannelMajor));
        }

        let got = throttled_run(model_stages(&config, &weights), &frames, &mut rng);
        assert_eq!(got.len(), expected.len(), "seed {seed}");
        assert_eq!(got, expected, "seed {seed}");
    }
}

#[test]
fn test_every_link_at_capacity_one() {
    let config = ModelConfig::tiny(4);
    let weights = ModelWeights::random(&config, 5);
    let mut rng = StdRng::seed_from_u64(17);
    let image = random_image(&config, &mut rng);

    let mut wide = Pipeline::new(model_stages(&config, &weights), 1024).unwrap();
    let mut narrow = Pipeline::new(model_stages(&config, &weights), 1).unwrap();
    assert_eq!(narrow.run_frame(&image).unwrap(), wide.run_frame(&image).unwrap());
}

#[test]
fn test_single_marker_per_frame() {
    let config = ModelConfig::tiny(6);
    let weights = ModelWeights::random(&config, 8);
    let mut rng = StdRng::seed_from_u64(4);
    let frames = [random_image(&config, &mut rng), random_image(&config, &mut rng)];
    let tokens = throttled_run(model_stages(&config, &weights), &frames, &mut rng);
    let markers: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.last)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(markers, vec![5, 11]);
}
