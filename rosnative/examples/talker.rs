use rosnative::{AdvertiseOptions, NodeHandle};
use rosnative_msgs::std_msgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let nh = NodeHandle::new("http://localhost:11311", "talker_rs").await?;
    let publisher = nh
        .advertise::<std_msgs::String>("/chatter", AdvertiseOptions::default())
        .await?;

    let mut count = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::warn!("ctrl-c, exiting");
                break;
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                let msg = std_msgs::String {
                    data: format!("hello world {count}"),
                };
                publisher.publish(&msg).await?;
                count += 1;
            }
        }
    }

    nh.shutdown().await?;
    Ok(())
}
