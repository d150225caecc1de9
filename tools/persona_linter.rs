/// Persona Linter: checks persona RON files before they reach a scene.
///
/// Usage: persona_linter <persona_file_or_dir>... [--target-lang <code>]

use dialogue_engine::core::lexicon::CompensationDevice;
use dialogue_engine::schema::persona::PersonaProfile;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("Usage: persona_linter <persona_file_or_dir>... [--target-lang <code>]");
        process::exit(0);
    }

    let mut paths = Vec::new();
    let mut target_lang = "en".to_string();

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--target-lang" && i + 1 < args.len() {
            i += 1;
            target_lang = args[i].clone();
        } else {
            paths.push(PathBuf::from(&args[i]));
        }
        i += 1;
    }

    let mut files = Vec::new();
    for path in &paths {
        if path.is_dir() {
            collect_ron_files(path, &mut files);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            eprintln!("ERROR: Path '{}' does not exist", path.display());
            process::exit(1);
        }
    }
    files.sort();

    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut personas: Vec<(PathBuf, PersonaProfile)> = Vec::new();

    for file in files {
        match load_personas(&file) {
            Ok(loaded) => {
                println!("  Loaded: {} ({} personas)", file.display(), loaded.len());
                personas.extend(loaded.into_iter().map(|p| (file.clone(), p)));
            }
            Err(e) => errors.push(format!("{}: {}", file.display(), e)),
        }
    }

    let mut seen_ids: HashMap<String, PathBuf> = HashMap::new();
    for (file, persona) in &personas {
        if let Some(first) = seen_ids.insert(persona.id.to_string(), file.clone()) {
            errors.push(format!(
                "persona '{}' defined in both {} and {}",
                persona.id,
                first.display(),
                file.display()
            ));
        }
        let (e, w) = lint_persona(persona, &target_lang);
        errors.extend(e);
        warnings.extend(w);
    }

    println!("\n=== Persona Lint Report ===\n");

    if errors.is_empty() && warnings.is_empty() {
        println!("All checks passed!");
    }

    for warning in &warnings {
        println!("WARNING: {}", warning);
    }

    for error in &errors {
        println!("ERROR: {}", error);
    }

    println!(
        "\nSummary: {} personas, {} errors, {} warnings",
        personas.len(),
        errors.len(),
        warnings.len()
    );

    if errors.is_empty() {
        process::exit(0);
    } else {
        process::exit(1);
    }
}

fn collect_ron_files(dir: &Path, files: &mut Vec<PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_ron_files(&path, files);
            } else if path.extension().and_then(|s| s.to_str()) == Some("ron") {
                files.push(path);
            }
        }
    }
}

/// Deserialize without validating, so every problem can be reported at once.
fn load_personas(path: &Path) -> Result<Vec<PersonaProfile>, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    ron::from_str::<Vec<PersonaProfile>>(&contents).map_err(|e| e.to_string())
}

fn lint_persona(persona: &PersonaProfile, target_lang: &str) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let id = &persona.id;

    if id.as_str().trim().is_empty() {
        errors.push(format!("persona '{}' has an empty id", persona.name));
    }
    if persona.first_person_form.trim().is_empty() {
        errors.push(format!("{id}: missing first_person_form"));
    }
    if !(0.0..=1.0).contains(&persona.baseline_intensity) {
        errors.push(format!(
            "{id}: baseline_intensity {} outside [0, 1]",
            persona.baseline_intensity
        ));
    }

    if persona.triggers.is_empty() {
        warnings.push(format!("{id}: no triggers; intensity will never move"));
    }
    let mut trigger_names = HashSet::new();
    for trigger in &persona.triggers {
        if !trigger_names.insert(trigger.name.as_str()) {
            errors.push(format!("{id}: duplicate trigger name '{}'", trigger.name));
        }
        if trigger.patterns.iter().all(|p| p.trim().is_empty()) {
            errors.push(format!("{id}: trigger '{}' has no patterns", trigger.name));
        }
        if let Some(ref mode) = trigger.mode_shift {
            if !persona.declares_mode(mode) {
                errors.push(format!(
                    "{id}: trigger '{}' shifts to undeclared mode '{}'",
                    trigger.name, mode
                ));
            }
        }
        if trigger.delta_intensity.abs() > 1.0 {
            warnings.push(format!(
                "{id}: trigger '{}' delta {} saturates the intensity range",
                trigger.name, trigger.delta_intensity
            ));
        }
    }

    for state in &persona.emotion_states {
        if !persona.declares_mode(&state.mode) {
            warnings.push(format!(
                "{id}: emotion state '{}' uses undeclared mode '{}'",
                state.name, state.mode
            ));
        }
    }

    let strategies = persona.compensation_for(target_lang);
    if strategies.is_empty() {
        warnings.push(format!("{id}: no compensation strategies for '{target_lang}'"));
    }
    for strategy in strategies {
        if CompensationDevice::recognize(strategy).is_none() {
            warnings.push(format!(
                "{id}: strategy '{strategy}' cannot be checked by the voice score"
            ));
        }
    }

    tracing::debug!(
        persona = %id,
        errors = errors.len(),
        warnings = warnings.len(),
        "persona linted"
    );
    (errors, warnings)
}
