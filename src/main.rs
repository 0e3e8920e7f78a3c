fn main() -> anyhow::Result<()> {
    cryptinit::run()
}
