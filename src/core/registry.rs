/// Persona registry: the cast a scene draws on, loaded from RON.
use std::collections::HashMap;
use std::path::Path;

use crate::schema::persona::{PersonaId, PersonaProfile, ProfileError};

/// Registry of all loaded personas, keyed by persona id.
#[derive(Debug, Clone, Default)]
pub struct PersonaRegistry {
    personas: HashMap<PersonaId, PersonaProfile>,
}

impl PersonaRegistry {
    pub fn new() -> Self {
        Self {
            personas: HashMap::new(),
        }
    }

    /// Validate and insert a persona. Re-registering an id is an error.
    pub fn register(&mut self, persona: PersonaProfile) -> Result<(), ProfileError> {
        persona.validate()?;
        if self.personas.contains_key(&persona.id) {
            return Err(ProfileError::Duplicate(persona.id));
        }
        tracing::debug!(persona = %persona.id, triggers = persona.triggers.len(), "registered persona");
        self.personas.insert(persona.id.clone(), persona);
        Ok(())
    }

    pub fn get(&self, id: &PersonaId) -> Option<&PersonaProfile> {
        self.personas.get(id)
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersonaProfile> {
        self.personas.values()
    }

    /// Parse a RON list of persona definitions and register each one.
    pub fn parse_ron(&mut self, input: &str) -> Result<(), ProfileError> {
        let personas: Vec<PersonaProfile> = ron::from_str(input)?;
        for persona in personas {
            self.register(persona)?;
        }
        Ok(())
    }

    /// Load personas from a RON file. The file should contain a list of persona definitions.
    pub fn load_from_ron(&mut self, path: &Path) -> Result<(), ProfileError> {
        let contents = std::fs::read_to_string(path)?;
        self.parse_ron(&contents)
    }

    /// Load every `.ron` file in a directory, in file-name order.
    pub fn load_dir(&mut self, dir: &Path) -> Result<(), ProfileError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "ron") {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            self.load_from_ron(&path)?;
        }
        Ok(())
    }
}
