//! WiFi station bring-up (ESP-IDF only).
//!
//! The engine needs an IP link before the broker transport can connect.
//! Credentials are baked in at build time through `SENSORLINK_WIFI_SSID`
//! and `SENSORLINK_WIFI_PASS`; provisioning is out of scope for this
//! firmware.

use anyhow::{Result, anyhow};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::info;

const SSID: &str = match option_env!("SENSORLINK_WIFI_SSID") {
    Some(s) => s,
    None => "sensorlink",
};
const PASSWORD: &str = match option_env!("SENSORLINK_WIFI_PASS") {
    Some(s) => s,
    None => "",
};

/// Join the configured access point and wait for an address. The returned
/// driver must stay alive for as long as the link is used.
pub fn connect_station(
    modem: Modem,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) -> Result<BlockingWifi<EspWifi<'static>>> {
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), Some(nvs))?, sysloop)?;

    let auth_method = if PASSWORD.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: SSID.try_into().map_err(|_| anyhow!("SSID longer than 32 bytes"))?,
        password: PASSWORD
            .try_into()
            .map_err(|_| anyhow!("password longer than 64 bytes"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("WIFI: connecting to '{}'", SSID);
    wifi.connect()?;
    wifi.wait_netif_up()?;

    let ip = wifi.wifi().sta_netif().get_ip_info()?;
    info!("WIFI: up, address {}", ip.ip);
    Ok(wifi)
}
