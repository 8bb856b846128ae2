//! Client against a scripted in-process INDI server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use astrocontrol_indi::{
    EventKind, IndiClient, IndiClientConfig, IndiEvent, IndiServer, Property, SwitchValue,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn start() -> (IndiClient, BufReader<TcpStream>) {
    start_with(IndiClientConfig::default()).await
}

async fn start_with(config: IndiClientConfig) -> (IndiClient, BufReader<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = IndiClient::with_config(IndiServer::new("127.0.0.1", port), config);
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    client.try_connect().await.unwrap();
    let socket = accept.await.unwrap();
    (client, BufReader::new(socket))
}

fn connect_switch(property: &Property) -> Option<bool> {
    property
        .as_vector::<SwitchValue>()
        .and_then(|v| v.switch("CONNECT"))
        .map(|s| s.is_on)
}

#[tokio::test]
async fn test_handshake_define_and_update() {
    let (client, mut server) = start().await;

    let found = Arc::new(Mutex::new(Vec::new()));
    let changes = Arc::new(Mutex::new(Vec::new()));
    {
        let found = found.clone();
        client.subscribe_to(EventKind::DeviceFound, move |event| {
            if let IndiEvent::DeviceFound(name) = event {
                found.lock().unwrap().push(name.clone());
            }
        });
        let changes = changes.clone();
        client.subscribe_to(EventKind::PropertyChanged, move |event| {
            if let IndiEvent::PropertyChanged { previous, next, .. } = event {
                changes
                    .lock()
                    .unwrap()
                    .push((connect_switch(previous), connect_switch(next)));
            }
        });
    }

    let mut line = String::new();
    server.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim_end(), r#"<getProperties version="1.7"/>"#);

    server
        .get_mut()
        .write_all(
            br#"<defSwitchVector device="Mount" name="CONNECTION" label="Connection" group="Main Control" state="Idle" perm="rw" rule="OneOfMany">
  <defSwitch name="CONNECT" label="Connect">Off</defSwitch>
  <defSwitch name="DISCONNECT" label="Disconnect">On</defSwitch>
</defSwitchVector>
"#,
        )
        .await
        .unwrap();

    wait_for(|| client.message_stats().applied == 1).await;
    assert!(!client.device("Mount").is_connected());
    assert_eq!(*found.lock().unwrap(), vec!["Mount".to_string()]);

    // Update split across two writes
    server
        .get_mut()
        .write_all(br#"<setSwitchVector device="Mount" name="CONNECTION" state="Ok">"#)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server
        .get_mut()
        .write_all(b"<oneSwitch name=\"CONNECT\">On</oneSwitch><oneSwitch name=\"DISCONNECT\">Off</oneSwitch></setSwitchVector>\n")
        .await
        .unwrap();

    wait_for(|| client.message_stats().applied == 2).await;
    assert!(client.device("Mount").is_connected());
    assert_eq!(*changes.lock().unwrap(), vec![(Some(false), Some(true))]);
    assert_eq!(found.lock().unwrap().len(), 1);
    assert_eq!(client.message_stats().failed, 0);

    client.disconnect().await;
    assert!(!client.is_connected());
    assert!(client.devices().is_empty());
}

#[tokio::test]
async fn test_device_connect_request_goes_out() {
    let (client, mut server) = start().await;

    let mut line = String::new();
    server.read_line(&mut line).await.unwrap();

    server
        .get_mut()
        .write_all(
            br#"<defSwitchVector device="Focuser" name="CONNECTION" state="Idle" perm="rw" rule="OneOfMany"><defSwitch name="CONNECT">Off</defSwitch><defSwitch name="DISCONNECT">On</defSwitch></defSwitchVector>"#,
        )
        .await
        .unwrap();
    wait_for(|| client.get_device("Focuser").is_some()).await;

    client.device("Focuser").connect().await.unwrap();

    line.clear();
    server.read_line(&mut line).await.unwrap();
    assert!(line.starts_with(r#"<newSwitchVector device="Focuser" name="CONNECTION""#));
    assert!(line.contains(r#"<oneSwitch name="CONNECT">On</oneSwitch>"#));
    assert!(line.contains(r#"<oneSwitch name="DISCONNECT">Off</oneSwitch>"#));

    line.clear();
    server.read_line(&mut line).await.unwrap();
    assert_eq!(
        line.trim_end(),
        r#"<getProperties version="1.7" device="Focuser"/>"#
    );
}

#[tokio::test]
async fn test_server_hangup_clears_devices() {
    let (client, mut server) = start().await;

    let disconnected = Arc::new(Mutex::new(0));
    {
        let disconnected = disconnected.clone();
        client.subscribe_to(EventKind::ServerDisconnected, move |_| {
            *disconnected.lock().unwrap() += 1;
        });
    }

    server
        .get_mut()
        .write_all(br#"<defTextVector device="CCD" name="DRIVER_INFO" perm="ro"><defText name="DRIVER_NAME">Sim</defText></defTextVector>"#)
        .await
        .unwrap();
    wait_for(|| client.get_device("CCD").is_some()).await;

    drop(server);
    wait_for(|| !client.is_connected()).await;
    wait_for(|| *disconnected.lock().unwrap() == 1).await;
    assert!(client.devices().is_empty());
}

/// Define `CONNECTION` followed by a second property. The second one is only
/// applied after any auto-connect request for the first has been queued.
async fn define_focuser(client: &IndiClient, server: &mut BufReader<TcpStream>, connected: bool) {
    let (connect, disconnect) = if connected { ("On", "Off") } else { ("Off", "On") };
    let xml = format!(
        r#"<defSwitchVector device="Focuser" name="CONNECTION" state="Idle" perm="rw" rule="OneOfMany"><defSwitch name="CONNECT">{}</defSwitch><defSwitch name="DISCONNECT">{}</defSwitch></defSwitchVector>
<defTextVector device="Focuser" name="DRIVER_INFO" perm="ro"><defText name="DRIVER_NAME">Sim</defText></defTextVector>
"#,
        connect, disconnect
    );
    server.get_mut().write_all(xml.as_bytes()).await.unwrap();
    wait_for(|| client.message_stats().applied == 2).await;
}

/// Next line the client writes after the handshake and any automatic requests
async fn next_line(server: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    server.read_line(&mut line).await.unwrap();
    line.trim_end().to_string()
}

const FOCUSER_QUERY: &str = r#"<getProperties version="1.7" device="Focuser"/>"#;

#[tokio::test]
async fn test_auto_connect_switches_device_on() {
    let (client, mut server) = start().await;
    client.set_auto_connect(true);
    assert_eq!(next_line(&mut server).await, r#"<getProperties version="1.7"/>"#);

    define_focuser(&client, &mut server, false).await;

    assert_eq!(
        next_line(&mut server).await,
        r#"<newSwitchVector device="Focuser" name="CONNECTION"><oneSwitch name="CONNECT">On</oneSwitch><oneSwitch name="DISCONNECT">Off</oneSwitch></newSwitchVector>"#
    );
}

#[tokio::test]
async fn test_auto_connect_from_config() {
    let config = IndiClientConfig {
        auto_connect_devices: true,
        ..Default::default()
    };
    let (client, mut server) = start_with(config).await;
    next_line(&mut server).await;

    define_focuser(&client, &mut server, false).await;

    assert!(next_line(&mut server)
        .await
        .starts_with(r#"<newSwitchVector device="Focuser" name="CONNECTION">"#));
}

#[tokio::test]
async fn test_no_auto_connect_when_disabled() {
    let (client, mut server) = start().await;
    assert!(!client.auto_connect());
    next_line(&mut server).await;

    define_focuser(&client, &mut server, false).await;
    client.query_device_properties("Focuser").await.unwrap();

    assert_eq!(next_line(&mut server).await, FOCUSER_QUERY);
}

#[tokio::test]
async fn test_no_auto_connect_when_already_connected() {
    let (client, mut server) = start().await;
    client.set_auto_connect(true);
    next_line(&mut server).await;

    define_focuser(&client, &mut server, true).await;
    client.query_device_properties("Focuser").await.unwrap();

    assert_eq!(next_line(&mut server).await, FOCUSER_QUERY);
}
