use anyhow::{Context as AnyhowContext, Result};
use std::fs;
use crate::dsl::Tree;

pub fn load_definition_from_yaml(file_path: &str) -> Result<Tree> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    parse_definition(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path))
}

pub fn parse_definition(yaml_content: &str) -> Result<Tree> {
    let tree: Tree = serde_yaml::from_str(yaml_content)?;
    Ok(tree)
}
