use rosnative::{NodeHandle, SubscribeOptions};
use rosnative_msgs::std_msgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    {
        let nh = NodeHandle::new("http://localhost:11311", "listener_rs").await?;
        let _subscriber = nh
            .subscribe::<std_msgs::String, _>("/chatter", SubscribeOptions::default(), |msg| {
                log::info!("[/listener_rs] Got message: {}", msg.data);
            })
            .await?;

        tokio::signal::ctrl_c().await?;
        log::warn!("ctrl-c, exiting");
        nh.shutdown().await?;
    }
    // Let the unregister calls drain before the process goes away
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    Ok(())
}
