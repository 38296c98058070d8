#[cfg(target_os = "espidf")]
mod board;
#[cfg(target_os = "espidf")]
mod console;
#[cfg(target_os = "espidf")]
mod context;
#[cfg(target_os = "espidf")]
mod http_api;
#[cfg(target_os = "espidf")]
mod storage;

#[cfg(target_os = "espidf")]
use firmware::run_app;

#[cfg(target_os = "espidf")]
fn main() {
    // It is necessary to call this function once. Otherwise, some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("Velux shutter controller starting");

    if let Err(e) = run_app() {
        log::error!("App error: {}", e);
        loop {
            log::info!("System halted.");
            esp_idf_svc::hal::delay::FreeRtos::delay_ms(10000);
        }
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!(
        "velux-shutter is ESP32 firmware; build it with an ESP-IDF target such as xtensa-esp32-espidf. \
         The drive logic in the library is exercised on the host with `cargo test`."
    );
    std::process::exit(1);
}

#[cfg(target_os = "espidf")]
mod firmware {
    use std::sync::{Arc, Mutex};
    use std::time;

    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::delay::FreeRtos;
    use esp_idf_svc::hal::gpio::{AnyIOPin, AnyOutputPin};
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::http::server::EspHttpServer;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};

    use velux_shutter::clock::SystemClock;
    use velux_shutter::config::DriveConfig;
    use velux_shutter::fleet::{Fleet, MotorBinding};

    use crate::board::{self, HBridgeEnable, Ina219Monitor, LedcBus};
    use crate::console::handle_stdin_command;
    use crate::context::AppContext;
    use crate::http_api;
    use crate::storage::{PinConfiguration, StorageManager};

    const TICK_INTERVAL_MS: u32 = 10;
    const MOTOR_TASK_STACK_SIZE: usize = 8 * 1024;
    const WIFI_CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(30);

    fn take_pin(all_pins: &mut [Option<AnyIOPin>], num: u32) -> anyhow::Result<AnyIOPin> {
        all_pins
            .get_mut(num as usize)
            .and_then(|p| p.take())
            .ok_or_else(|| anyhow::anyhow!("GPIO{} is unavailable or already in use", num))
    }

    fn take_output(all_pins: &mut [Option<AnyIOPin>], num: u32) -> anyhow::Result<AnyOutputPin> {
        Ok(<AnyIOPin as Into<AnyOutputPin>>::into(take_pin(all_pins, num)?))
    }

    pub fn run_app() -> anyhow::Result<()> {
        let sysloop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;
        let peripherals = Peripherals::take()?;
        let p = peripherals.pins;

        // 1 and 3 carry the console UART, 6..=11 the flash, 34..=39 are input only.
        let mut all_pins: Vec<Option<AnyIOPin>> = vec![
            Some(p.gpio0.into()), None, Some(p.gpio2.into()),
            None, Some(p.gpio4.into()), Some(p.gpio5.into()),
            None, None, None, None, None, None,
            Some(p.gpio12.into()), Some(p.gpio13.into()), Some(p.gpio14.into()),
            Some(p.gpio15.into()), Some(p.gpio16.into()), Some(p.gpio17.into()),
            Some(p.gpio18.into()), Some(p.gpio19.into()), None,
            Some(p.gpio21.into()), Some(p.gpio22.into()), Some(p.gpio23.into()),
            None, Some(p.gpio25.into()), Some(p.gpio26.into()), Some(p.gpio27.into()),
            None, None, None, None,
            Some(p.gpio32.into()), Some(p.gpio33.into()),
        ];

        let mut storage_manager = StorageManager::new(nvs)?;

        let drive_config = match storage_manager.get_drive_config() {
            Ok(config) => {
                log::info!("Loaded drive config from NVS");
                config.sanitized()
            }
            Err(_) => {
                log::info!("No drive config found in NVS, using default");
                let default_config = DriveConfig::default();
                storage_manager.set_drive_config(&default_config)?;
                default_config
            }
        };

        let pin_config = match storage_manager.get_pin_configuration() {
            Ok(config) => config,
            Err(_) => {
                log::info!("No pin configuration found in NVS, using default");
                let default_config = PinConfiguration::default();
                storage_manager.set_pin_configuration(&default_config)?;
                default_config
            }
        };
        log::info!("Pin configuration: {:?}", pin_config);

        let bus = LedcBus::new(
            peripherals.ledc,
            take_output(&mut all_pins, pin_config.pwm_open)?,
            take_output(&mut all_pins, pin_config.pwm_close)?,
            &drive_config,
        )?;

        let i2c = board::shared_i2c(
            peripherals.i2c0,
            take_pin(&mut all_pins, pin_config.i2c_sda)?,
            take_pin(&mut all_pins, pin_config.i2c_scl)?,
        )?;

        let bindings = pin_config
            .motor_enable
            .iter()
            .zip(pin_config.ina219_addresses)
            .map(|(&(open_pin, close_pin), address)| -> anyhow::Result<MotorBinding> {
                Ok(MotorBinding {
                    pins: Box::new(HBridgeEnable::new(
                        take_output(&mut all_pins, open_pin)?,
                        take_output(&mut all_pins, close_pin)?,
                    )?),
                    sensor: Box::new(Ina219Monitor::new(i2c.clone(), address)),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let storage_manager = Arc::new(Mutex::new(storage_manager));

        let mut fleet = Fleet::build(
            Box::new(bus),
            Arc::new(SystemClock::new()),
            storage_manager.clone(),
            &drive_config,
            bindings,
        )?;
        fleet.begin();

        let app_context = AppContext {
            storage_manager: storage_manager.clone(),
            fleet: Arc::new(Mutex::new(fleet)),
        };

        // the tick loop must run before anything can command a motor
        {
            let app_context = app_context.clone();
            std::thread::Builder::new()
                .name("motor".into())
                .stack_size(MOTOR_TASK_STACK_SIZE)
                .spawn(move || run_motor_loop(app_context))?;
        }

        // setup stdin command handler
        {
            let app_context = app_context.clone();
            std::thread::spawn(move || handle_stdin_command(app_context));
        }

        // setup wifi
        let mut wifi = EspWifi::new(peripherals.modem, sysloop.clone(), None)?;
        if let Err(e) = connect_wifi(&mut wifi, &app_context) {
            log::error!("Failed to connect to wifi: {}", e);
        }

        // setup http api
        let mut server = EspHttpServer::new(&Default::default())?;
        http_api::register_handlers(&mut server, app_context)?;

        loop {
            FreeRtos::delay_ms(1000);
        }
    }

    fn connect_wifi(wifi: &mut EspWifi, app_context: &AppContext) -> anyhow::Result<()> {
        let (opt_ssid, opt_password) = {
            let storage = app_context.storage();
            (storage.get_ssid(), storage.get_password())
        };
        if let (Ok(saved_ssid), Ok(saved_password)) = (opt_ssid, opt_password) {
            if saved_ssid.is_empty() {
                log::info!("SSID is empty. Please set it via UART command: set_wifi_ssid <your_ssid>");
            } else {
                let mut ssid = heapless::String::<32>::new();
                ssid.push_str(&saved_ssid)
                    .map_err(|_| anyhow::anyhow!("SSID is too long"))?;
                let mut password = heapless::String::<64>::new();
                password
                    .push_str(&saved_password)
                    .map_err(|_| anyhow::anyhow!("Password is too long"))?;

                let wifi_configuration = Configuration::Client(ClientConfiguration {
                    ssid,
                    password,
                    auth_method: AuthMethod::WPA2Personal,
                    ..Default::default()
                });
                wifi.set_configuration(&wifi_configuration)?;

                wifi.start()?;
                wifi.connect()?;
                log::info!("WiFi connecting, SSID: {}", saved_ssid);
                let started = time::Instant::now();
                while !wifi.is_up()? {
                    if started.elapsed() > WIFI_CONNECT_TIMEOUT {
                        anyhow::bail!("WiFi did not come up within {:?}", WIFI_CONNECT_TIMEOUT);
                    }
                    FreeRtos::delay_ms(10);
                }
                log::info!("WiFi connected, IP: {:?}", wifi.sta_netif().get_ip_info()?.ip);
            }
        } else {
            log::info!("WiFi SSID or password not set. Please set them via UART commands:\r\nset_wifi_ssid <your_ssid>\r\nset_wifi_password <your_password>");
        }
        Ok(())
    }

    fn run_motor_loop(app_context: AppContext) -> ! {
        log::info!("Starting motor loop");
        let mut update_counter = 0;
        let mut last_update_counter_reset = time::Instant::now();

        loop {
            app_context.fleet().tick();
            FreeRtos::delay_ms(TICK_INTERVAL_MS);

            update_counter += 1;
            if last_update_counter_reset.elapsed() > time::Duration::from_secs(60) {
                log::info!("Motor task update per second: {}", update_counter as f64 / 60.0);
                last_update_counter_reset = time::Instant::now();
                update_counter = 0;
            }
        }
    }
}
