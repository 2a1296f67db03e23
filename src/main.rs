use log::{error, info};
use std::sync::Arc;
use std::thread;

use gpio_edge::{DaemonConfig, EdgeDetector};

#[cfg(not(feature = "sysfs-gpio"))]
use gpio_edge::MockDriver;
#[cfg(feature = "sysfs-gpio")]
use gpio_edge::SysfsDriver;

fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIO_EDGE_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = DaemonConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let driver = {
        #[cfg(feature = "sysfs-gpio")]
        {
            SysfsDriver::new(&config.detector)
        }
        #[cfg(not(feature = "sysfs-gpio"))]
        {
            MockDriver::default()
        }
    };
    let detector = EdgeDetector::new(driver, &config.detector);

    for watch in &config.watch {
        let edge = watch.edge;
        let registered = detector
            .register_callback(
                watch.pin,
                Arc::new(move |pin: u32| info!("gpio {pin}: {} edge", edge.as_str())),
            )
            .and_then(|_| detector.add_edge_detection(watch.pin, watch.edge, watch.bounce_ms));
        if let Err(e) = registered {
            error!("watch gpio {}: {e}", watch.pin);
            detector.unregister_callbacks(watch.pin);
        }
    }

    info!(
        "Watching gpio {:?} under {}...",
        detector.registered_pins(),
        config.detector.sysfs_root.display()
    );

    loop {
        thread::park();
    }
}
