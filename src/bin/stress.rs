use clap::{value_t, App, Arg};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Barrier};
use std::time::{Duration, Instant};

use crossbeam_utils::thread::scope;
use rand::distributions::WeightedIndex;
use rand::prelude::*;

use split_list_map::SplitListMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Op {
    Get,
    Insert,
    Remove,
}

impl Op {
    const OPS: [Op; 3] = [Op::Get, Op::Insert, Op::Remove];
}

struct Config {
    threads: usize,
    range: usize,
    prefill: usize,
    interval: u64,
    op_weights: [usize; 3],
}

fn main() {
    let matches = App::new("stress")
        .arg(
            Arg::with_name("threads")
                .short("t")
                .value_name("THREADS")
                .help("Numbers of threads to run.")
                .takes_value(true)
                .default_value("8"),
        )
        .arg(
            Arg::with_name("range")
                .short("r")
                .value_name("RANGE")
                .help("Key space: keys are drawn uniformly from 0..RANGE.")
                .takes_value(true)
                .default_value("100000"),
        )
        .arg(
            Arg::with_name("prefill")
                .short("p")
                .value_name("PREFILL")
                .help("Number of keys inserted before measurement starts.")
                .takes_value(true)
                .default_value("50000"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .value_name("INTERVAL")
                .help("Time interval in seconds to run the benchmark.")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("read heavy")
                .short("g")
                .help("Use a 90% get / 5% insert / 5% remove mix instead of a uniform one."),
        )
        .get_matches();

    let config = Config {
        threads: value_t!(matches, "threads", usize).unwrap(),
        range: value_t!(matches, "range", usize).unwrap(),
        prefill: value_t!(matches, "prefill", usize).unwrap(),
        interval: value_t!(matches, "interval", u64).unwrap(),
        op_weights: if matches.is_present("read heavy") {
            [18, 1, 1]
        } else {
            [1, 1, 1]
        },
    };
    bench(&config);
}

fn bench(config: &Config) {
    println!(
        "{} threads, range {}, {}s",
        config.threads, config.range, config.interval
    );

    let map = &SplitListMap::<usize, usize>::new();
    {
        let mut handle = map.handle();
        let mut rng = rand::thread_rng();
        let mut prefilled = 0;
        while prefilled < config.prefill.min(config.range) {
            if map.try_add(rng.gen_range(0..config.range), prefilled, &mut handle) {
                prefilled += 1;
            }
        }
    }

    let keep_going = &AtomicBool::new(true);
    let barrier = &Barrier::new(config.threads);
    let dist = &WeightedIndex::new(config.op_weights).unwrap();
    let duration = Duration::from_secs(config.interval);

    let mut ops_per_sec = 0;
    let (sender, receiver) = mpsc::channel();
    scope(|s| {
        for _ in 0..config.threads {
            let sender = sender.clone();
            s.spawn(move |_| {
                let mut handle = map.handle();
                let mut rng = rand::thread_rng();
                let mut ops: u64 = 0;

                barrier.wait();
                let start = Instant::now();

                while keep_going.load(Ordering::Relaxed) {
                    let key = rng.gen_range(0..config.range);
                    match Op::OPS[dist.sample(&mut rng)] {
                        Op::Get => {
                            map.get(&key, &mut handle);
                        }
                        Op::Insert => {
                            map.try_add(key, key, &mut handle);
                        }
                        Op::Remove => {
                            map.remove(&key, &mut handle);
                        }
                    }
                    ops += 1;
                    if start.elapsed() > duration {
                        keep_going.store(false, Ordering::Relaxed);
                    }
                }

                sender.send(ops).unwrap();
            });
        }
        drop(sender);

        let mut ops = 0;
        for _ in 0..config.threads {
            ops += receiver.recv().unwrap();
        }
        ops_per_sec = ops / config.interval;
    })
    .unwrap();

    println!("ops/s: {}", ops_per_sec);
    println!("final size: {}", map.size());
}
