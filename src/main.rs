use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    gatehouse::cli::main()
}
