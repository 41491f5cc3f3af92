//! Tests against a real AWS account.
//!
//! Run with `cargo test -p pipeline -- --ignored` and credentials for a
//! sandbox account in the environment.
use pipeline::{
    aws::{
        ec2::{DefaultVpc, SecurityGroup},
        AwsContext,
    },
    names::{Environment, Names},
    wait::WaitConfig,
    Outcome, Store,
};

async fn context() -> AwsContext {
    let _ = env_logger::builder().is_test(true).try_init();
    AwsContext::load(None).await.unwrap()
}

#[tokio::test]
#[ignore = "requires AWS credentials"]
async fn resolves_the_caller_account() {
    let aws = context().await;
    assert_eq!(12, aws.account().len());
    assert!(aws.account().chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
#[ignore = "requires AWS credentials"]
async fn security_group_ensure_is_idempotent() {
    let aws = context().await;
    let names = Names::new("pipeline-it", Environment::Dev);
    let wait = WaitConfig::default();
    let mut store = Store::new(aws);

    let mut group_ids = vec![];
    for _ in 0..2 {
        let vpc = store.lookup("default-vpc", DefaultVpc).unwrap();
        let group = store
            .resource(
                "security-group",
                SecurityGroup {
                    name: names.security_group(),
                    description: "integration test".to_owned(),
                    vpc_id: vpc.remote(|v| v.vpc_id.clone()),
                    ingress_cidr: vpc.remote(|v| v.cidr.clone()),
                    port: 8080,
                    wait,
                },
            )
            .unwrap();
        let group_id = group.remote(|g| g.group_id.clone());
        let plan = store.plan().unwrap();
        store.apply(plan).await.unwrap();
        group_ids.push(group_id.get().unwrap());
    }
    assert_eq!(group_ids[0], group_ids[1]);

    store
        .destroy(
            "security-group",
            SecurityGroup::named(names.security_group(), wait),
        )
        .unwrap();
    let plan = store.plan().unwrap();
    let applied = store.apply(plan).await.unwrap();
    assert_eq!(Outcome::Destroyed, applied[0].outcome);
}
