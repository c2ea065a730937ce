use candle_core::{DType, Device, Tensor, Var};
use finetune::{
    optimizer::adafactor::rms, Adafactor, AdafactorConfig, DecayRateSchedule, Gradient,
    LearningRateSchedule, ParameterSet, ParameterStore,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn ones(shapes: &[&[usize]]) -> ParameterSet {
    let params = shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            (
                format!("layer{i}.weight"),
                Var::ones(*shape, DType::F32, &Device::Cpu).unwrap(),
            )
        })
        .collect();
    ParameterSet::new(params)
}

fn dense(values: &[f32], shape: &[usize]) -> Option<Gradient> {
    Some(Gradient::Dense(
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap(),
    ))
}

fn flat(params: &ParameterSet, index: usize) -> Vec<f32> {
    params
        .get(index)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn matrix_keeps_row_and_column_factors() {
    let params = ones(&[&[4, 3]]);
    let optimizer = Adafactor::new(AdafactorConfig::default(), &params).unwrap();

    let slot = &optimizer.slots()[0];
    assert!(slot.is_factored());
    assert!(!slot.has_momentum());
    assert_eq!(slot.auxiliary_len(), 7);

    let state = optimizer.state_tensors();
    assert_eq!(state["layer0.weight/row"].dims(), &[4]);
    assert_eq!(state["layer0.weight/col"].dims(), &[3]);
}

#[test]
fn vectors_and_scalars_keep_full_accumulators() {
    let params = ones(&[&[5], &[]]);
    let optimizer = Adafactor::new(AdafactorConfig::default(), &params).unwrap();
    assert!(!optimizer.slots()[0].is_factored());
    assert_eq!(optimizer.slots()[0].auxiliary_len(), 5);
    assert_eq!(optimizer.slots()[1].auxiliary_len(), 1);
}

#[test]
fn higher_rank_parameters_factor_the_last_two_axes() {
    let params = ones(&[&[2, 3, 4]]);
    let optimizer = Adafactor::new(AdafactorConfig::default(), &params).unwrap();
    let state = optimizer.state_tensors();
    assert_eq!(state["layer0.weight/row"].dims(), &[2, 3]);
    assert_eq!(state["layer0.weight/col"].dims(), &[2, 4]);
    assert_eq!(optimizer.auxiliary_len(), 14);
}

#[test]
fn momentum_slot_only_with_positive_beta1() {
    let params = ones(&[&[2, 2]]);
    let with = Adafactor::new(
        AdafactorConfig {
            beta1: 0.9,
            ..AdafactorConfig::default()
        },
        &params,
    )
    .unwrap();
    assert!(with.slots()[0].has_momentum());
    assert!(with.state_tensors().contains_key("layer0.weight/momentum"));

    let without = Adafactor::new(AdafactorConfig::default(), &params).unwrap();
    assert!(!without.slots()[0].has_momentum());
}

#[test]
fn first_step_matches_hand_computation() {
    // Unit gradient on unit weights: the normalized update is all ones, the
    // relative step is min(1, 0.01) and the parameter scale is 1.
    let params = ones(&[&[2, 2]]);
    let mut optimizer = Adafactor::new(AdafactorConfig::default(), &params).unwrap();
    let grads = vec![dense(&[1.0; 4], &[2, 2])];

    let report = optimizer.step(&params, &grads, 0).unwrap();
    assert_eq!(report.updated, 1);
    assert!((report.learning_rate - 0.01).abs() < 1e-12);
    assert_eq!(report.decay_rate, 0.0);
    for value in flat(&params, 0) {
        assert!((value - 0.99).abs() < 1e-6, "{value}");
    }
}

#[test]
fn momentum_averages_the_update() {
    let params = ones(&[&[2, 2]]);
    let config = AdafactorConfig {
        beta1: 0.9,
        ..AdafactorConfig::default()
    };
    let mut optimizer = Adafactor::new(config, &params).unwrap();
    optimizer
        .step(&params, &vec![dense(&[1.0; 4], &[2, 2])], 0)
        .unwrap();
    for value in flat(&params, 0) {
        assert!((value - 0.999).abs() < 1e-6, "{value}");
    }
}

#[test]
fn clipped_update_rms_is_bounded() {
    let mut rng = StdRng::seed_from_u64(17);
    let shapes: [&[usize]; 4] = [&[7], &[3, 5], &[2, 3, 4], &[]];

    for scale in [1e-20f32, 1e-3, 1.0, 1e6] {
        let params = ones(&shapes);
        let config = AdafactorConfig {
            learning_rate: LearningRateSchedule::Constant { value: 0.5 },
            multiply_by_parameter_scale: false,
            ..AdafactorConfig::default()
        };
        let mut optimizer = Adafactor::new(config, &params).unwrap();

        for step in 0..4 {
            let grads: Vec<Option<Gradient>> = shapes
                .iter()
                .map(|shape| {
                    let count = shape.iter().product::<usize>();
                    let values: Vec<f32> = (0..count)
                        .map(|_| rng.gen_range(-1.0f32..1.0) * scale)
                        .collect();
                    dense(&values, shape)
                })
                .collect();
            // Var::set writes in place, so keep a detached copy.
            let before: Vec<Tensor> = (0..shapes.len())
                .map(|index| params.get(index).unwrap().copy().unwrap())
                .collect();

            optimizer.step(&params, &grads, step).unwrap();

            for (index, before) in before.iter().enumerate() {
                let delta = before.sub(&params.get(index).unwrap()).unwrap();
                let normalized = rms(&delta).unwrap() / 0.5;
                assert!(
                    normalized.is_finite() && normalized <= 1.0 + 1e-4,
                    "scale {scale:e} step {step} param {index}: update rms {normalized}"
                );
            }
        }
    }
}

#[test]
fn sparse_rows_leave_other_rows_untouched() {
    let params = ones(&[&[3, 2]]);
    let mut optimizer = Adafactor::new(AdafactorConfig::default(), &params).unwrap();
    let grads = vec![Some(Gradient::Sparse {
        indices: Tensor::new(&[0u32], &Device::Cpu).unwrap(),
        values: Tensor::new(&[[1f32, 1.0]], &Device::Cpu).unwrap(),
    })];
    optimizer.step(&params, &grads, 0).unwrap();

    let values = flat(&params, 0);
    assert!((values[0] - 0.99).abs() < 1e-5, "{values:?}");
    assert!((values[1] - 0.99).abs() < 1e-5, "{values:?}");
    assert_eq!(&values[2..], &[1.0; 4]);
}

#[test]
fn adam_decay_schedule_tracks_beta2() {
    assert_eq!(DecayRateSchedule::Adam { beta2: 0.999 }.at(0), 0.0);
    let late = DecayRateSchedule::Adam { beta2: 0.999 }.at(100_000);
    assert!((late - 0.999).abs() < 1e-6);
    let pow = DecayRateSchedule::default().at(1);
    assert!((pow - (1.0 - 2f64.powf(-0.8))).abs() < 1e-12);
}

#[test]
fn relative_step_is_scaled_without_parameter_scale() {
    let schedule = LearningRateSchedule::RelativeStep;
    assert!((schedule.at(0, true) - 0.01).abs() < 1e-12);
    assert!((schedule.at(0, false) - 0.0005).abs() < 1e-12);
    assert!((schedule.at(99_999, true) - 100_000f64.powf(-0.5)).abs() < 1e-12);
}
