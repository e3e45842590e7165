//! Integration tests for the CloudSigma client
//!
//! These tests require a CloudSigma account.
//! Set CLOUDSIGMA_REGION, CLOUDSIGMA_USERNAME and CLOUDSIGMA_PASSWORD to run.

use cloudsigma_client::{CloudClientTrait, CloudSigmaClient, Credentials, region_api_url};

fn client() -> CloudSigmaClient {
    let region = std::env::var("CLOUDSIGMA_REGION").unwrap_or_else(|_| "zrh".to_string());
    let username = std::env::var("CLOUDSIGMA_USERNAME")
        .expect("CLOUDSIGMA_USERNAME environment variable must be set");
    let password = std::env::var("CLOUDSIGMA_PASSWORD")
        .expect("CLOUDSIGMA_PASSWORD environment variable must be set");

    CloudSigmaClient::new(
        region_api_url(&region),
        region,
        Credentials::Basic { username, password },
    )
    .expect("Failed to create client")
}

#[tokio::test]
#[ignore] // Requires CloudSigma account
async fn test_validate_credentials() {
    client().validate_credentials().await.expect("credentials rejected");
}

#[tokio::test]
#[ignore]
async fn test_list_servers() {
    let servers = client().list_servers().await.expect("Failed to list servers");
    println!("Found {} servers", servers.len());
}

#[tokio::test]
#[ignore]
async fn test_list_ips_classifies_pools() {
    let ips = client().list_ips().await.expect("Failed to list IPs");
    for ip in ips {
        println!(
            "{} subscribed={} attached={:?}",
            ip.address(),
            ip.has_subscription(),
            ip.attached_server()
        );
    }
}

#[tokio::test]
#[ignore]
async fn test_get_missing_server_is_not_found() {
    let err = client()
        .get_server("00000000-0000-0000-0000-000000000000")
        .await
        .expect_err("lookup should fail");
    assert!(err.is_not_found() || err.is_permission_denied());
}
