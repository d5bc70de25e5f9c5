use rosnative::{NodeHandle, ServiceClientOptions};
use rosnative_msgs::rospy_tutorials::{AddTwoInts, AddTwoIntsRequest, AddTwoIntsResponse};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let nh = NodeHandle::new("http://localhost:11311", "add_two_ints_rs").await?;
    let _server = nh
        .advertise_service::<AddTwoInts, _>("/add_two_ints", |request: AddTwoIntsRequest| {
            log::info!("Adding {} + {}", request.a, request.b);
            Ok(AddTwoIntsResponse {
                sum: request.a + request.b,
            })
        })
        .await?;

    let client = nh
        .service_client::<AddTwoInts>("/add_two_ints", ServiceClientOptions::default())
        .await?;
    let response = client.call(&AddTwoIntsRequest { a: 2, b: 3 }).await?;
    log::info!("2 + 3 = {}", response.sum);

    nh.shutdown().await?;
    Ok(())
}
