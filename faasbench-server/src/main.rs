use anyhow::Result;

fn main() -> Result<()> {
    faasbench_server::cli::execute()
}
