use kube::CustomResourceExt;
use serving_operator::resources::{
    configurations::Configuration, revisions::Revision, routes::Route, services::Service,
};

fn main() -> anyhow::Result<()> {
    for crd in [
        Service::crd(),
        Configuration::crd(),
        Revision::crd(),
        Route::crd(),
    ] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
