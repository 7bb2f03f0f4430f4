//! Memory-read benchmark.
//!
//! Measures repeated bulk reads of the whole structure for up to 20 seconds
//! to expose the effects of non-real-time host scheduling, then writes the
//! per-iteration results to `speed_test.csv` and prints a summary.

use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};

use log::error;

use super::control::TargetLog;
use crate::conn::Connection;
use crate::error::Result;
use crate::logger;

/// Most reads a single benchmark run performs.
pub const BENCHMARK_REPEAT_COUNT: usize = 1000;

/// Wall-clock cap on a benchmark run.
pub const MAX_BENCHMARK_TIME: Duration = Duration::from_secs(20);

const REPORT_FILE: &str = "speed_test.csv";

impl<C: Connection> TargetLog<C> {
    /// Benchmark the transfer speed. `interrupted` is polled between
    /// iterations so a keystroke can cut the run short.
    pub fn benchmark(&mut self, interrupted: &mut dyn FnMut() -> bool) -> Result<()> {
        println!(
            "\nMeasuring the read memory times...\n\
             Wait max. 20 seconds for the benchmark to complete."
        );

        // Logging slows the transfer down enough to skew the numbers.
        if !self.config().debug {
            logger::enable(false);
        }
        let result = self.run_benchmark(interrupted);
        logger::enable(true);
        result
    }

    fn run_benchmark(&mut self, interrupted: &mut dyn FnMut() -> bool) -> Result<()> {
        self.load_header()?;
        let block_size = self.config().size;

        let mut times_ms: Vec<f64> = Vec::with_capacity(BENCHMARK_REPEAT_COUNT);
        let benchmark_start = Instant::now();

        while times_ms.len() < BENCHMARK_REPEAT_COUNT {
            let started = Instant::now();
            if let Err(e) = self.read_structure() {
                println!(
                    "\nBenchmark terminated prematurely - problem reading from the target: {}",
                    e
                );
                break;
            }
            times_ms.push(started.elapsed().as_secs_f64() * 1e3);

            if interrupted() {
                println!("\nBenchmark terminated with a keystroke.");
                break;
            }
            if benchmark_start.elapsed() > MAX_BENCHMARK_TIME {
                break;
            }
        }

        if times_ms.len() > 1 {
            report(block_size, &times_ms);
        }
        Ok(())
    }
}

fn report(block_size: u32, times_ms: &[f64]) {
    let min_time = times_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max_time = times_ms.iter().copied().fold(0.0, f64::max);
    let time_sum: f64 = times_ms.iter().sum();

    // bytes per millisecond is the same number as kB/s.
    let min_speed = block_size as f64 / max_time;
    let avg_speed = block_size as f64 * times_ms.len() as f64 / time_sum;

    let summary = format!(
        "Minimal time {:.1} ms, maximal time {:.1} ms, block size {} bytes.\n\
         Minimal speed {:.1} kB/s, average speed: {:.1} kB/s.",
        min_time, max_time, block_size, min_speed, avg_speed
    );

    match File::create(REPORT_FILE) {
        Ok(mut csv) => {
            let _ = writeln!(csv, "Count;Time [ms];Data transfer speed [kB/s]");
            for (i, time) in times_ms.iter().enumerate() {
                let _ = writeln!(csv, "{:4};{:.1};{:.1}", i + 1, time, block_size as f64 / time);
            }
            let _ = writeln!(csv);
            let _ = writeln!(csv, "{}", summary);
        }
        Err(e) => error!("Cannot create file '{}': {}", REPORT_FILE, e),
    }

    println!("\n{}", summary);
}
