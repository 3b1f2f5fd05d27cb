use memserver::{BUFFER_SIZE, Client, ProcessVmReader, Server};
use std::os::unix::{io::AsRawFd, net::UnixStream};

/// Requests larger than the server's buffer are answered in contiguous,
/// buffer sized chunks
#[test]
fn splits_large_requests() {
    let (server_sock, client_sock) = UnixStream::pair().unwrap();

    let server = std::thread::spawn(move || {
        let mut buffer = [0u8; BUFFER_SIZE];
        let reader = ProcessVmReader::new(std::process::id() as i32);
        Server::new(server_sock.as_raw_fd(), reader, &mut buffer).run()
    });

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let base = data.as_ptr() as u64;

    let mut client = Client::new(client_sock);
    client.send_request(base, data.len() as u64).unwrap();

    let mut chunks = Vec::new();
    let mut received = Vec::new();
    while received.len() < data.len() {
        let resp = client.recv_response().unwrap();
        assert!(resp.len > 0, "unexpected error response {resp:?}");

        let mut payload = vec![0u8; resp.len as usize];
        client.recv_payload(&mut payload).unwrap();
        received.extend_from_slice(&payload);
        chunks.push(resp);
    }

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.iter().map(|c| c.len).sum::<i64>(), 10_000);

    let mut expected_addr = base;
    for chunk in &chunks {
        assert_eq!(chunk.addr, expected_addr);
        expected_addr += chunk.len as u64;
    }

    assert_eq!(received, data);

    // The higher level read reassembles the same thing
    assert_eq!(client.read_vec(base, data.len()).unwrap(), data);

    drop(client);
    assert!(server.join().unwrap(), "server did not shut down cleanly");
}
