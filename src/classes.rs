use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::model::ClassId;

#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    by_name: HashMap<String, ClassId>,
    by_id: BTreeMap<ClassId, String>,
}

impl ClassTable {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open class list {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("invalid class list {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = Self::default();
        for record in csv_reader.records() {
            let record = record.context("failed to read class list row")?;
            let line = record.position().map(|pos| pos.line()).unwrap_or_default();

            if record.len() != 2 {
                bail!("line {line}: format should be 'class_name,class_id'");
            }
            let name = &record[0];
            let id = record[1]
                .parse::<ClassId>()
                .with_context(|| format!("line {line}: malformed class id '{}'", &record[1]))?;

            table
                .insert(name, id)
                .with_context(|| format!("line {line}: rejected class entry"))?;
        }

        Ok(table)
    }

    #[cfg(test)]
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, ClassId)>,
    {
        let mut table = Self::default();
        for (name, id) in pairs {
            table.insert(name, id)?;
        }
        Ok(table)
    }

    fn insert(&mut self, name: &str, id: ClassId) -> Result<()> {
        if name.is_empty() {
            bail!("class name is empty");
        }
        if self.by_name.contains_key(name) {
            bail!("duplicate class name: '{name}'");
        }
        if let Some(existing) = self.by_id.get(&id) {
            bail!("duplicate class id {id} for '{name}' (already used by '{existing}')");
        }
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ClassId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
