#[tokio::main]
async fn main() {
    if let Err(e) = printshop_desk_lib::run().await {
        eprintln!("printshop-desk: {e}");
        std::process::exit(1);
    }
}
