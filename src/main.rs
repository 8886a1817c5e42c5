fn main() -> anyhow::Result<()> {
    apt_pipeline::cli::run()
}
