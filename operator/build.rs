use kube::CustomResourceExt;
use std::fs;
use vidra_types::*;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/infrahub.operators.com_infrahubsync_crd.yaml",
        serde_yaml::to_string(&InfrahubSync::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/infrahub.operators.com_vidraresource_crd.yaml",
        serde_yaml::to_string(&VidraResource::crd()).unwrap(),
    )
    .unwrap();
}
