//! Scripted client that plays one card through the relay: a reveal, a drop
//! and a robot move, printing every reply it receives.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// WebSocket URL of the relay server
    #[clap(short, long, default_value = "ws://127.0.0.1:8765")]
    url: String,
    /// Card id used for all three events
    #[clap(short, long, default_value = "test-card-1")]
    card_id: String,
    /// Delay between reveal and drop in milliseconds
    #[clap(short, long, default_value = "1250")]
    delay_ms: u64,
    /// Robot condition reported in the RobotsMove event
    #[clap(short, long, default_value = "control")]
    robot: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (ws_stream, _) = connect_async(args.url.as_str()).await?;
    println!("Connected to {}", args.url);
    let (mut write, mut read) = ws_stream.split();

    let events = [
        json!({
            "event": "cardReveal",
            "cardId": args.card_id,
            "participant": "P01",
            "side": "left",
            "answer": "42",
        }),
        json!({
            "event": "cardDropped",
            "cardId": args.card_id,
            "side_choice": "left",
        }),
        json!({
            "event": "RobotsMove",
            "cardId": args.card_id,
            "question": "What is six times seven?",
            "difficulty": "easy",
            "Robot": args.robot,
            "gazeDecision": "left",
        }),
    ];

    for (i, event) in events.iter().enumerate() {
        if i == 1 {
            sleep(Duration::from_millis(args.delay_ms)).await;
        }

        let text = event.to_string();
        println!("-> {}", text);
        write.send(Message::Text(text.into())).await?;

        match timeout(Duration::from_secs(2), read.next()).await {
            Ok(Some(Ok(Message::Text(reply)))) => println!("<- {}", reply.as_str()),
            Ok(Some(Ok(other))) => println!("<- {:?}", other),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => {
                println!("Server closed the connection");
                return Ok(());
            }
            Err(_) => println!("No reply within 2s"),
        }
    }

    write.close().await?;
    println!("Done");
    Ok(())
}
