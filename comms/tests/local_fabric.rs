//! Cross-thread behavior of the in-process fabric: ordering, wait-any,
//! pool-driven backpressure and shutdown poisoning.

use std::{sync::Arc, thread, time::Duration};

use comms::{
    BufferPool, CommsErr, LocalEndpoint, LocalFabric, Transport, wait_any,
    specs::{CONTROL_CHANNEL, layer_channel},
};

fn world(ranks: u32, channels: u32) -> Vec<LocalEndpoint> {
    let fabric = LocalFabric::new(ranks, channels);
    (0..ranks).map(|r| fabric.endpoint(r).unwrap()).collect()
}

#[test]
fn per_sender_fifo_on_one_channel() {
    let mut endpoints = world(2, 1);
    let receiver = endpoints.pop().unwrap();
    let sender = endpoints.pop().unwrap();
    let pool = BufferPool::new(16, 1);

    let feeder = thread::spawn(move || {
        for v in 0..8 {
            let mut buf = pool.checkout();
            buf.write_floats(&[v as f32]);
            sender.post_send(buf, 1, v, 0).unwrap();
        }
        pool
    });

    let recv_pool = BufferPool::new(4, 1);
    for expect in 0..8 {
        let done = receiver
            .recv_blocking(recv_pool.checkout(), Some(0), None, 0)
            .unwrap();
        assert_eq!(done.tag, expect);
        assert_eq!(done.buf.as_floats(), &[expect as f32]);
    }

    let pool = feeder.join().unwrap();
    // Matched sends completed, so every sender buffer went home.
    assert_eq!(pool.available(), pool.capacity());
}

#[test]
fn channels_do_not_order_against_each_other() {
    let mut endpoints = world(2, 3);
    let receiver = endpoints.pop().unwrap();
    let sender = endpoints.pop().unwrap();
    let pool = BufferPool::new(8, 1);

    // Send on layer channels 1 and 2, then drain channel 2 first.
    for channel in [layer_channel(0), layer_channel(1)] {
        let mut buf = pool.checkout();
        buf.write_floats(&[channel as f32]);
        sender.post_send(buf, 1, 1, channel).unwrap();
    }

    let done = receiver
        .recv_blocking(pool.checkout(), None, None, layer_channel(1))
        .unwrap();
    assert_eq!(done.buf.as_floats(), &[2.0]);

    let done = receiver
        .recv_blocking(pool.checkout(), None, None, layer_channel(0))
        .unwrap();
    assert_eq!(done.buf.as_floats(), &[1.0]);
}

#[test]
fn wait_any_completes_ready_receives_in_any_order() {
    let mut endpoints = world(3, 2);
    let receiver = endpoints.remove(0);
    let pool = BufferPool::new(16, 2);

    let mut posted = Vec::new();
    for channel in 0..2 {
        posted.push(
            receiver
                .post_recv(pool.checkout(), None, None, channel)
                .unwrap(),
        );
    }

    let senders: Vec<_> = endpoints
        .into_iter()
        .map(|endpoint| {
            let pool = BufferPool::new(2, 2);
            thread::spawn(move || {
                let rank = endpoint.rank();
                let mut buf = pool.checkout();
                buf.write_floats(&[rank as f32]);
                endpoint
                    .post_send(buf, 0, rank, (rank % 2) as u32)
                    .unwrap()
                    .wait()
                    .unwrap();
            })
        })
        .collect();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let done = wait_any(&mut posted).unwrap();
        seen.push(done.src);
        // Keep one receive posted per channel, like the gradient collector.
        posted.push(
            receiver
                .post_recv(pool.checkout(), None, None, done.channel)
                .unwrap(),
        );
    }

    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
    assert_eq!(posted.len(), 2);

    for sender in senders {
        sender.join().unwrap();
    }
}

#[test]
fn sender_parks_on_an_empty_pool_until_the_receiver_drains() {
    let mut endpoints = world(2, 1);
    let receiver = endpoints.pop().unwrap();
    let sender = endpoints.pop().unwrap();

    // Two buffers: the sender can have at most two unmatched sends, the
    // third checkout blocks until the receiver consumes one.
    let pool = Arc::new(BufferPool::new(2, 1));

    let feeder = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            for v in 0..3 {
                let mut buf = pool.checkout();
                buf.write_floats(&[v as f32]);
                sender.post_send(buf, 1, v, 0).unwrap();
            }
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!feeder.is_finished(), "third checkout should be parked");

    let recv_pool = BufferPool::new(4, 1);
    for expect in 0..3 {
        let done = receiver
            .recv_blocking(recv_pool.checkout(), None, None, 0)
            .unwrap();
        assert_eq!(done.tag, expect);
    }

    feeder.join().unwrap();
}

#[test]
fn close_unblocks_a_parked_wait_any() {
    let mut endpoints = world(2, 2);
    let receiver = endpoints.pop().unwrap();
    let closer = endpoints.pop().unwrap();
    let pool = BufferPool::new(4, 1);

    let mut posted = vec![
        receiver
            .post_recv(pool.checkout(), None, None, CONTROL_CHANNEL)
            .unwrap(),
    ];

    let waiter = thread::spawn(move || wait_any(&mut posted));

    thread::sleep(Duration::from_millis(30));
    closer.close();

    assert!(matches!(waiter.join().unwrap(), Err(CommsErr::Closed)));
}
