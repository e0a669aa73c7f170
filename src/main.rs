fn main() -> std::process::ExitCode {
    onionwall_lib::run()
}
