//! `mkminimod <input.elf> <output.mlk>`: builds a program module from a compiled ELF object.

use std::process::ExitCode;

use minilink::host::module_builder::build_module;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let [_, input, output] = args.as_slice() else {
        eprintln!("usage: mkminimod <input.elf> <output.mlk>");
        return ExitCode::FAILURE;
    };

    let elf_bytes = match std::fs::read(input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("mkminimod: could not read {input}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let module = match build_module(&elf_bytes) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("mkminimod: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::write(output, module) {
        eprintln!("mkminimod: could not write {output}: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
