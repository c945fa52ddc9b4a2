use kube::CustomResourceExt;
use pingsource_controller_apis::PingSource;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&PingSource::crd()).unwrap());
}
