// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::env;
use std::time::Duration;

use pubsub_client::EventHandler;

fn main() {
    env::set_var("RUST_LOG", "info");
    env_logger::init();

    let address = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7482".to_string());
    let handler = EventHandler::new("demo-endpoint", address.as_str()).expect("connect to broker");

    handler
        .subscribe(
            "hello",
            |data| log::info!("received on 'hello': {}", data),
            false,
            true,
        )
        .expect("subscribe to 'hello'");

    handler
        .publish("hello", serde_json::json!({ "greeting": "hi there" }))
        .expect("publish to 'hello'");

    std::thread::sleep(Duration::from_millis(200));
    handler.close(Some(Duration::from_secs(1)));
}
