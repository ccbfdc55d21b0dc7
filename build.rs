use std::fs;
use std::path::Path;

// Every directory under src/rules/ holding a mod.rs is compiled in as a rule module.
fn main() {
    println!("cargo:rerun-if-changed=src/rules/");

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let rules_dir = Path::new(&manifest_dir).join("src/rules");

    let mut modules: Vec<String> = fs::read_dir(&rules_dir)
        .expect("src/rules/ directory not found")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("mod.rs").is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    modules.sort();

    let content: String = modules
        .iter()
        .map(|module| {
            let rule_path = rules_dir.join(module).join("mod.rs");
            format!("#[path = {:?}]\npub(crate) mod {};\n", rule_path, module)
        })
        .collect();

    let out_dir = std::env::var("OUT_DIR").unwrap();
    fs::write(Path::new(&out_dir).join("rule_modules.rs"), content).unwrap();
}
