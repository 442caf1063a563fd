fn main() -> anyhow::Result<()> {
    duocall_lib::run()
}
