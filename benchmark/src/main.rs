use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use pb::client_operation::Type;
use pb::kv_service_client::KvServiceClient;
use pb::{ClientOperation, ClientRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Delay between requests in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Leader address
    #[arg(short, long, default_value = "http://127.0.0.1:4000")]
    server: String,

    /// Ratio of reads mixed into the workload, in percent
    #[arg(short, long, default_value = "10")]
    reads: u64,
}

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

fn write_request(key: u64, value: u64) -> ClientRequest {
    ClientRequest {
        operations: vec![ClientOperation {
            r#type: Type::Write as i32,
            key: format!("key-{}", key).into_bytes(),
            value: format!("value-{}", value).into_bytes(),
        }],
    }
}

fn read_request(key: u64) -> ClientRequest {
    ClientRequest {
        operations: vec![ClientOperation {
            r#type: Type::Read as i32,
            key: format!("key-{}", key).into_bytes(),
            value: Vec::new(),
        }],
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let server_addr = args.server.clone();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let total_requests = Arc::new(Mutex::new(0u64));
    let failed_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, interval {} ms, {}% reads",
        args.concurrency, args.interval, args.reads
    );

    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let failed_requests = failed_requests.clone();
        let read_ratio = args.reads;
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            let mut client = match KvServiceClient::connect(server_addr).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Failed to connect to server: {}", e);
                    return;
                }
            };

            loop {
                let key = rand::random::<u64>() % 1000;
                let request = if rand::random::<u64>() % 100 < read_ratio {
                    read_request(key)
                } else {
                    write_request(key, rand::random::<u64>())
                };

                let start = Instant::now();
                match client.execute(tonic::Request::new(request)).await {
                    Ok(response) => {
                        let elapsed = start.elapsed();
                        if response.get_ref().success {
                            let mut hist = histogram.lock().await;
                            hist.record(elapsed.as_micros() as u64).unwrap();
                            let mut total = total_requests.lock().await;
                            *total += 1;
                        } else {
                            let mut failed = failed_requests.lock().await;
                            *failed += 1;
                        }
                    }
                    Err(e) => eprintln!("Request failed: {}", e),
                }

                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    sleep(Duration::from_secs(args.duration)).await;

    for handle in handles {
        handle.abort();
    }

    let total = *total_requests.lock().await;
    let failed = *failed_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Rejected Requests: {}", failed);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
