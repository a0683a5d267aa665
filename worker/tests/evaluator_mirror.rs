//! The evaluator against a scripted coordinator: the greeting handshake,
//! mirroring the newest broadcast and scoring every step it observes.

use std::{sync::Arc, thread, time::Duration};

use comms::{BufferPool, Consistency, LocalFabric, PoolBuf, RunSpec, Transport, msg, specs};
use machine_learning::{Dataset, Model, Network, NetworkSpec};
use worker::Evaluator;

fn step_word(pool: &BufferPool, step: u32) -> PoolBuf {
    let mut buf = pool.checkout();
    msg::write_step(&mut buf, step);
    buf
}

#[test]
fn evaluator_echoes_the_greeting_and_scores_the_steps_it_sees() {
    let net_spec = NetworkSpec::new(vec![(3, 4), (4, 2)], 4, 0.05).unwrap();
    let run = RunSpec {
        layer_sizes: vec![net_spec.layer_len(0), net_spec.layer_len(1)],
        workers: 1,
        consistency: Consistency::FullSync,
        shortcircuit: false,
        rounds: 4,
        pool_capacity: 8,
        recvs_per_channel: 1,
        eval_every: 1,
    };

    let fabric = LocalFabric::new(3, run.channels());
    let coordinator = fabric.endpoint(specs::COORDINATOR_RANK).unwrap();
    let endpoint = Arc::new(fabric.endpoint(specs::EVALUATOR_RANK).unwrap());

    let sizes = run.layer_sizes.clone();
    let script = thread::spawn(move || {
        let control = BufferPool::new(8, specs::CONTROL_SLOTS);
        let data = BufferPool::new(8, 16);

        let mut hello = control.checkout();
        msg::write_control(
            &mut hello,
            &specs::Control::Hello {
                name: "mirror_run".into(),
            },
        )
        .unwrap();
        coordinator
            .send_blocking(
                hello,
                specs::EVALUATOR_RANK,
                specs::HELLO_TAG,
                specs::CONTROL_CHANNEL,
            )
            .unwrap();
        let echo = coordinator
            .recv_blocking(
                control.checkout(),
                Some(specs::EVALUATOR_RANK),
                Some(specs::HELLO_TAG),
                specs::CONTROL_CHANNEL,
            )
            .unwrap();
        let specs::Control::Hello { name } = msg::read_control(&echo.buf).unwrap();
        assert_eq!(name, "mirror_run");

        // The run jumps from step 1 to step 3; the evaluator scores what it
        // observes, not every step that happened.
        for step in [1u32, 3] {
            for (layer, &len) in sizes.iter().enumerate() {
                let mut buf = data.checkout();
                buf.write_floats(&vec![0.01 * step as f32; len]);
                coordinator
                    .send_blocking(buf, specs::EVALUATOR_RANK, step, specs::layer_channel(layer))
                    .unwrap();
            }
            // Let the receiver file the payloads before the step moves, and
            // the mirror score the step before the next batch lands.
            thread::sleep(Duration::from_millis(100));
            coordinator
                .send_blocking(
                    step_word(&control, step),
                    specs::EVALUATOR_RANK,
                    specs::STEP_TAG,
                    specs::CONTROL_CHANNEL,
                )
                .unwrap();
            thread::sleep(Duration::from_millis(100));
        }

        coordinator
            .send_blocking(
                step_word(&control, specs::STEP_SENTINEL),
                specs::EVALUATOR_RANK,
                specs::STEP_TAG,
                specs::CONTROL_CHANNEL,
            )
            .unwrap();
    });

    let mut network = Network::new(net_spec, 9).unwrap();
    let holdout = Dataset::blobs(8, 2, 3, 3.0, 21).unwrap();
    let (name, records) = Evaluator::new(endpoint, run)
        .run(&mut network, &holdout)
        .unwrap();
    script.join().unwrap();

    assert_eq!(name, "mirror_run");
    let steps: Vec<u32> = records.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![1, 3]);
    for record in &records {
        assert!(record.loss.is_finite());
        assert!((0.0..=1.0).contains(&record.error_rate));
    }
    // The newest broadcast is what stays committed.
    assert!(network.weights(0).iter().all(|&w| (w - 0.03).abs() < 1e-6));
    assert!(network.weights(1).iter().all(|&w| (w - 0.03).abs() < 1e-6));
}
