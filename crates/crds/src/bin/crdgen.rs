//! Prints the Policy CustomResourceDefinition as YAML.

use crds::Policy;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Policy::crd())?);
    Ok(())
}
