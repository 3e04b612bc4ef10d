pub mod common;
pub mod vcluster_e2e;

use common::Error;
use std::env;
use vcluster_e2e::{vcluster_e2e_test, vcluster_scaling_e2e_test};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_default();
    match cmd.as_str() {
        "vcluster" => {
            println!("Running virtual cluster end-to-end test");
            vcluster_e2e_test().await
        }
        "vcluster-scaling" => {
            println!("Running virtual cluster end-to-end test for scaling");
            vcluster_scaling_e2e_test().await
        }
        _ => {
            println!("Please specify one test: vcluster or vcluster-scaling");
            Ok(())
        }
    }
}
