use super::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

fn random(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn random_scan(channels: usize, state_size: usize, mode: ScanMode, seed: u64) -> SelectiveScan {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut linear = |out: usize| Linear::new(random(out * channels, &mut rng), Some(random(out, &mut rng)), channels, out);

    SelectiveScan {
        fc_delta: linear(channels),
        fc_b: linear(state_size),
        fc_c: linear(state_size),
        a_log: (0..channels).flat_map(|_| (1..=state_size).map(|n| (n as f32).ln())).collect(),
        channels,
        state_size,
        mode,
    }
}

fn assert_close(expected: &[f32], actual: &[f32], tolerance: f32) {
    assert_eq!(expected.len(), actual.len());
    for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
        assert!((e - a).abs() <= tolerance * (1.0 + e.abs()), "index {i}: {e} vs {a}");
    }
}

#[test]
fn test_scalar_recurrence_by_hand() -> Result<()> {
    // Δ = softplus(0) = ln 2, A = -1, B = C = 1, so h[t] = h[t-1] / 2 + ln 2 · x[t]
    let constant = |bias: f32| Linear::new(vec![0.0], Some(vec![bias]), 1, 1);
    let scan = SelectiveScan {
        fc_delta: constant(0.0),
        fc_b: constant(1.0),
        fc_c: constant(1.0),
        a_log: vec![0.0],
        channels: 1,
        state_size: 1,
        mode: ScanMode::Sequential,
    };

    let (y, state) = scan.forward(&[1.0, 0.0, 0.0, 2.0], 1, 4, None)?;

    let ln2 = 2f32.ln();
    let expected = [ln2, ln2 / 2.0, ln2 / 4.0, ln2 / 8.0 + 2.0 * ln2];
    assert_close(&expected, &y, 1e-6);
    assert_close(&expected[3..], state.as_slice(), 1e-6);

    Ok(())
}

#[test]
fn test_scan_primitives() {
    assert_eq!(sequential_scan(&[0.5, 0.5, 2.0], &[1.0, 1.0, 0.0], 0.0), vec![1.0, 1.5, 3.0]);
    assert_eq!(associative_scan(&[0.5, 0.5, 2.0], &[1.0, 1.0, 0.0], 0.0), vec![1.0, 1.5, 3.0]);
    assert_eq!(sequential_scan(&[1.0], &[0.0], 4.0), vec![4.0]);
}

/// The tree reduction reassociates the products, so the two scans agree up to rounding.
#[test]
fn test_associative_scan_matches_sequential_up_to_rounding() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(21);
    for len in [1, 2, 3, 7, 16, 33] {
        let a = (0..len).map(|_| rng.gen_range(0.0f32..1.0)).collect::<Vec<_>>();
        let b = random(len, &mut rng);
        let init = rng.gen_range(-1.0f32..1.0);
        assert_close(&sequential_scan(&a, &b, init), &associative_scan(&a, &b, init), 1e-5);
    }

    let (batch, seq_len, channels) = (3, 9, 4);
    let x = random(batch * seq_len * channels, &mut rng);
    let (y_seq, h_seq) = random_scan(channels, 5, ScanMode::Sequential, 8).forward(&x, batch, seq_len, None)?;
    let (y_assoc, h_assoc) = random_scan(channels, 5, ScanMode::Associative, 8).forward(&x, batch, seq_len, None)?;

    assert_close(&y_seq, &y_assoc, 1e-5);
    assert_close(h_seq.as_slice(), h_assoc.as_slice(), 1e-5);
    Ok(())
}

#[test]
fn test_state_carries_across_calls() -> Result<()> {
    let scan = random_scan(3, 4, ScanMode::Sequential, 2);
    let (batch, channels) = (2, 3);
    let x = random(batch * 6 * channels, &mut StdRng::seed_from_u64(4));

    let (full, full_state) = scan.forward(&x, batch, 6, None)?;

    let split = |from: usize, to: usize| -> Vec<f32> {
        (0..batch).flat_map(|b| x[(b * 6 + from) * channels..(b * 6 + to) * channels].to_vec()).collect()
    };
    let (first, state) = scan.forward(&split(0, 4), batch, 4, None)?;
    let (second, last_state) = scan.forward(&split(4, 6), batch, 2, Some(&state))?;

    for b in 0..batch {
        assert_close(&full[b * 6 * channels..(b * 6 + 4) * channels], &first[b * 4 * channels..(b + 1) * 4 * channels], 1e-5);
        assert_close(&full[(b * 6 + 4) * channels..(b + 1) * 6 * channels], &second[b * 2 * channels..(b + 1) * 2 * channels], 1e-5);
    }
    assert_close(full_state.as_slice(), last_state.as_slice(), 1e-5);
    Ok(())
}

#[test]
fn test_rejects_empty_sequence() {
    let scan = random_scan(2, 2, ScanMode::Sequential, 1);
    let error = scan.forward(&[], 1, 0, None).unwrap_err();
    assert!(error.to_string().contains("non-empty"));
}

#[test]
fn test_rejects_state_of_other_batch() -> Result<()> {
    let scan = random_scan(2, 3, ScanMode::Sequential, 1);
    let x = vec![0.1; 2 * 4 * 2];

    let (_, state) = scan.forward(&x[..4 * 2], 1, 4, None)?;
    assert_eq!(state.batch(), 1);

    let error = scan.forward(&x, 2, 4, Some(&state)).unwrap_err();
    assert!(error.to_string().contains("Recurrent state"));

    assert!(scan.forward(&x, 2, 4, Some(&SsmState::zeros(2, 3, 3))).is_err());
    assert!(scan.forward(&x, 2, 4, Some(&SsmState::zeros(2, 2, 3))).is_ok());
    Ok(())
}

#[test]
fn test_discretization_step_is_positive() -> Result<()> {
    let scan = random_scan(4, 2, ScanMode::Sequential, 13);
    let x = random(3 * 4, &mut StdRng::seed_from_u64(14));

    assert!(scan.fc_delta.forward(&x).iter().all(|&d| softplus(d) > 0.0));
    Ok(())
}

#[test]
fn test_underflowing_step_holds_the_state() -> Result<()> {
    let (channels, state_size, seq_len) = (4, 2, 5);
    let mut scan = random_scan(channels, state_size, ScanMode::Sequential, 15);
    scan.fc_delta.bias = Some(vec![-200.0; channels]);
    let x = random(seq_len * channels, &mut StdRng::seed_from_u64(16));
    assert!(scan.fc_delta.forward(&x).iter().all(|&d| softplus(d) == 0.0));

    let init = SsmState { batch: 1, channels, state_size, h: vec![1.0; channels * state_size] };
    let (y, state) = scan.forward(&x, 1, seq_len, Some(&init))?;

    assert!(y.iter().all(|v| v.is_finite()));
    assert_close(init.as_slice(), state.as_slice(), 1e-6);
    Ok(())
}
