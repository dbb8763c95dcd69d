#![no_main]

use libfuzzer_sys::fuzz_target;
use vira_target::TargetRegistry;

fuzz_target!(|data: &[u8]| {
    // Any module that deserializes must lower or fail with an error, never panic.
    if let Ok(module) = serde_json::from_slice::<vira_ir::Module>(data) {
        let registry = TargetRegistry::with_builtins();
        for name in ["v1", "v2", "v3"] {
            if let Ok(target) = registry.resolve(name) {
                let _ = vira_lower::run(module.clone(), target);
            }
        }
    }
});
