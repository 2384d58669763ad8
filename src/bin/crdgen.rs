use kube::CustomResourceExt;
use system_registry_orchestrator::crd::UserOperation;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&UserOperation::crd())?);
    Ok(())
}
