// AutoFollow — ESP-NOW transport.
//
// Brings the Wi-Fi stack up in station mode purely as a carrier, parks
// the radio on the rig's fixed channel, and registers the single peer.
// No AP association ever happens; both nodes just agree on the channel.

use anyhow::{Context, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::espnow::{EspNow, PeerInfo, SendStatus};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::{
    esp, esp_wifi_get_channel, esp_wifi_set_channel, wifi_interface_t_WIFI_IF_STA,
    wifi_second_chan_t, wifi_second_chan_t_WIFI_SECOND_CHAN_NONE,
};

use crate::link::node::format_mac;
use crate::link::Transport;

pub struct EspNowTransport {
    espnow: EspNow<'static>,
    _wifi: EspWifi<'static>,
    peer: [u8; 6],
}

// The ESP-NOW and Wi-Fi driver handles are process singletons guarded by
// the IDF; all calls made through &self here are thread-safe on the IDF
// side, and `peer` is immutable after construction.
unsafe impl Send for EspNowTransport {}
unsafe impl Sync for EspNowTransport {}

impl EspNowTransport {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        peer: [u8; 6],
        channel: u8,
    ) -> Result<Self> {
        let mut wifi = EspWifi::new(modem, sysloop, Some(nvs)).context("bringing up wifi")?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
        wifi.start()?;
        esp!(unsafe { esp_wifi_set_channel(channel, wifi_second_chan_t_WIFI_SECOND_CHAN_NONE) })
            .with_context(|| format!("parking radio on channel {channel}"))?;

        let espnow = EspNow::take().context("taking esp-now driver")?;
        let transport = Self {
            espnow,
            _wifi: wifi,
            peer,
        };
        transport.add_peer(channel)?;

        log::info!(
            "wireless link up: channel {}, peer {}",
            channel,
            format_mac(&peer)
        );
        Ok(transport)
    }

    fn add_peer(&self, channel: u8) -> Result<()> {
        let mut info = PeerInfo::default();
        info.peer_addr = self.peer;
        info.channel = channel;
        info.ifidx = wifi_interface_t_WIFI_IF_STA;
        info.encrypt = false;
        self.espnow
            .add_peer(info)
            .with_context(|| format!("registering peer {}", format_mac(&self.peer)))?;
        Ok(())
    }

    fn current_channel(&self) -> u8 {
        let mut primary: u8 = 0;
        let mut secondary: wifi_second_chan_t = wifi_second_chan_t_WIFI_SECOND_CHAN_NONE;
        unsafe {
            esp_wifi_get_channel(&mut primary, &mut secondary);
        }
        primary
    }

    /// Route inbound frames into the protocol engine. The callback runs
    /// on the Wi-Fi task; keep it to a copy and a notify.
    pub fn on_receive(&self, mut callback: impl FnMut(&[u8]) + Send + 'static) -> Result<()> {
        self.espnow
            .register_recv_cb(move |_src, data| callback(data))?;
        Ok(())
    }

    /// Delivery-status callback, also on the Wi-Fi task.
    pub fn on_sent(&self, mut callback: impl FnMut(bool) + Send + 'static) -> Result<()> {
        self.espnow
            .register_send_cb(move |_dst, status| callback(matches!(status, SendStatus::SUCCESS)))?;
        Ok(())
    }
}

impl Transport for EspNowTransport {
    fn send(&self, frame: &[u8]) -> Result<()> {
        self.espnow.send(self.peer, frame)?;
        Ok(())
    }

    /// Drop and re-add the peer on whatever channel the radio currently
    /// occupies. Standard recovery after a failed send.
    fn reregister_peer(&self) -> Result<()> {
        if let Err(e) = self.espnow.del_peer(self.peer) {
            log::debug!("peer removal before re-register failed: {e}");
        }
        self.add_peer(self.current_channel())
    }

    fn close(&self) -> Result<()> {
        self.espnow.del_peer(self.peer)?;
        Ok(())
    }
}
