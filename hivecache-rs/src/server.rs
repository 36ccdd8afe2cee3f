//! Contains the server component of hivecache.
//!
//! Opens a server-socket on the specified port (**server.port** in the config or 2610 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each incoming client is expected to send RESP requests and will be provided
//! with the appropriate responses. Peers fetching values from each other connect to the very
//! same server, so a node has exactly one listening socket.
//!
//! Note that in order to achieve zero downtime demands, the server will periodically try to
//! bind the socket to the selected port, therefore a "new" instance can be started and the
//! "old" one can bleed out while the port is "handed through" with minimal downtime. Also,
//! this listens to change events of the config and will relocate to another port or host if
//! changed.
//!
//! # Commands
//!
//! The server understands the following commands:
//! * **PING**: `PING` simply responds with PONG.
//! * **CACHE.GET**: `CACHE.GET group key` performs a cached lookup for the given key in the
//!   given group and responds with the value as bulk string. An unknown group or a failing
//!   origin lookup yields an error.
//! * **CACHE.STATS**: `CACHE.STATS` provides an overview of all groups. `CACHE.STATS group`
//!   provides detailed metrics about the given group.
use crate::average::Average;
use crate::config::Config;
use crate::fmt::format_size;
use crate::group::{CacheError, Registry};
use crate::platform::Platform;
use crate::request::Request;
use crate::response::{Response, SEPARATOR};
use crate::spawn;
use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::{TcpListener, TcpStream};

/// Specifies the timeout when waiting for incoming data on a client connection.
///
/// When waiting for incoming data we need to interrupt this every once in a while to check
/// if either the platform is being shut down or if the connection was killed manually.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Determines the pre-allocated receive buffer size for incoming requests. Most requests will
/// fit into this buffer so that no additional allocations are required when handling a
/// command.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the platform has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Represents a client connection.
pub struct Connection {
    peer_address: String,
    active: AtomicBool,
    commands: Average,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.peer_address == other.peer_address
    }
}

impl Connection {
    /// Determines if the connection is active or if a termination has been requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Terminates the connection.
    pub fn quit(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Provides an average recording the runtime of commands.
    pub fn commands(&self) -> &Average {
        &self.commands
    }
}

/// Provides some metadata for a client connection.
pub struct ConnectionInfo {
    /// Contains the peer address of the client being connected.
    pub peer_address: String,

    /// Contains the number of commands which have been received along with their average
    /// runtime.
    pub commands: Average,
}

/// Represents a server which manages all TCP connections.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done
    /// manually via [event_loop](Server::event_loop) as it is most probably done in the main
    /// thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
            connections: Mutex::new(Vec::new()),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Lists all currently active connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut result = Vec::new();
        for connection in self.connections.lock().unwrap().iter() {
            result.push(ConnectionInfo {
                peer_address: connection.peer_address.clone(),
                commands: connection.commands.clone(),
            });
        }

        result
    }

    /// Adds a newly created client connection.
    ///
    /// Note that this involves locking a **Mutex**. However, we expect our clients (and our
    /// peers) to use connection pooling, so that only a few rather long running connections
    /// are present.
    fn add_connection(&self, connection: Arc<Connection>) {
        self.connections.lock().unwrap().push(connection);
    }

    /// Removes a connection after it has been closed by either side.
    fn remove_connection(&self, connection: Arc<Connection>) {
        let mut mut_connections = self.connections.lock().unwrap();
        if let Some(index) = mut_connections
            .iter()
            .position(|other| *other == connection)
        {
            let _ = mut_connections.remove(index);
        }
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of
    /// the server. Rather we toggle this flag to false if a config and therefore address
    /// change was detected. This way **server_loop** will exit and a new server socket for
    /// the appropriate address will be set up by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default
    /// we use port 2610 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.root()["server"]["host"].as_str().unwrap_or("0.0.0.0"),
                    handle.root()["server"]["port"]
                        .as_i64()
                        .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                        .unwrap_or(2610)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:2610".to_owned())
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server socket has been
    /// bound.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() || server.current_address.lock().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve incoming client
    /// connections.
    ///
    /// The task of this loop is to bind the server socket to the specified address. Once this
    /// was successful, we enter the [server_loop](Server::server_loop) to actually handle
    /// incoming connections. Once this loop returns, either the platform is no longer running
    /// and we should exit, or the config has changed and we should try to bind the server to
    /// the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the server is started for the first time or if it has been restarted due to
            // a config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            // Bind and hopefully enter the server_loop...
            if let Ok(listener) = TcpListener::bind(&address).await {
                log::info!("Opened server socket on {}...", &address);
                *self.current_address.lock().unwrap() = Some(address.clone());
                self.server_loop(&listener).await;
                log::info!("Closing server socket on {}.", &address);
            } else {
                // If we were unable to bind to the server, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open server address: {}. Retrying every 500ms...",
                        &address
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Runs the main server loop which processes incoming connections.
    ///
    /// This also listens on config changes and exits to the event_loop if necessary (server
    /// address changed...).
    async fn server_loop(&self, listener: &TcpListener) {
        let mut config_changed_flag = self.platform.require::<Config>().notifier();

        while self.platform.is_running() && self.is_running() {
            tokio::select! {
                // We use a timeout here so that the while condition (esp.
                // platform.is_running()) is checked every once in a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    // We're only interested in a positive result here, as an Err simply
                    // indicates that the timeout was hit - in this case we do nothing as the
                    // while condition is all that needs to be checked...
                    if let Ok(stream) = timeout_stream {
                        if let Ok((stream, _)) = stream {
                            self.handle_new_connection(stream);
                        } else {
                            // The socket has been closed, therefore we exit to the event_loop
                            // which will either completely exit or try to re-create the
                            // socket.
                            return;
                        }
                    }
                }
                _ = config_changed_flag.recv() => {
                    // If the config was changed, we need to check if the address itself
                    // changed...
                    let new_address = self.address();
                    if let Some(current_address) = &*self.current_address.lock().unwrap() {
                       if current_address != &new_address {
                           log::info!("Server address has changed. Restarting server socket...");

                           // Force the event_loop to re-evaluate the expected server
                           // address...
                           self.running.store(false, Ordering::Release);

                           // Return to event_loop so that the server socket is re-created...
                           return;
                       }
                    }
               }
            }
        }
    }

    /// Handles a new incoming connection.
    ///
    /// This will register the connection in the list of client connections and then fork a
    /// "thread" which mainly executes the **protocol_loop** for this connection.
    fn handle_new_connection(&self, stream: TcpStream) {
        let platform = self.platform.clone();
        spawn!(async move {
            // Mark the connection as nodelay, as we already optimize all writes as far as
            // possible.
            let _ = stream.set_nodelay(true);

            // Register the new connection so that we can report it in the maintenance
            // utilities...
            let server = platform.require::<Server>();
            let connection = Arc::new(Connection {
                peer_address: stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_owned()),
                active: AtomicBool::new(true),
                commands: Average::new(),
            });
            log::debug!("Opened connection from {}...", connection.peer_address);
            server.add_connection(connection.clone());

            // Executes the client loop for this connection....
            if let Err(error) = protocol_loop(platform, connection.clone(), stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    connection.peer_address,
                    error
                );
            }

            // Removes the connection as it has been closed...
            log::debug!("Closing connection to {}...", connection.peer_address);
            server.remove_connection(connection);
        });
    }
}

/// Executed per client to process incoming RESP commands.
async fn protocol_loop(
    platform: Arc<Platform>,
    connection: Arc<Connection>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    // Pre-allocate a buffer for incoming requests. This will only be re-allocated if a
    // request was larger than 8 KB...
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while platform.is_running() && connection.is_active() {
        // We apply a timeout here, so that the condition of the while loop is checked every
        // once in a while...
        match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await {
            // Best case, we read some bytes from the socket..
            Ok(Ok(bytes_read)) if bytes_read > 0 => match Request::parse(&input_buffer) {
                // aaand we were able to parse a RESP request from the data in the buffer...
                Ok(Some(request)) => {
                    log::debug!("Received {}", request.command());

                    let watch = Instant::now();
                    let request_len = request.len();
                    let response = handle_request(&platform, &request).await;
                    connection.commands.add(watch.elapsed().as_micros() as i32);

                    writer.write_all(response.complete().as_ref()).await?;
                    writer.flush().await?;

                    input_buffer = clear_input_buffer(input_buffer, request_len);
                }
                Err(error) => {
                    handle_protocol_error(error, &mut writer).await?;

                    // Return from the loop to effectively close the connection...
                    return Ok(());
                }
                // A partial RESP request is present - do nothing so that we keep on
                // reading...
                _ => (),
            },

            // Reading from the client returned a zero length result -> the client wants to
            // close the connection. We therefore return from this loop.
            Ok(Ok(0)) => return Ok(()),

            // An IO error occurred while reading - notify our caller and abort...
            Ok(Err(error)) => {
                return Err(anyhow!(
                    "An error occurred while reading from the client: {}",
                    error
                ));
            }

            // The timeout elapsed before any data was read => do nothing, all we want to do
            // is to re-evaluate our while condition anyway...
            _ => (),
        }
    }

    Ok(())
}

async fn handle_protocol_error(
    error: anyhow::Error,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    // We received an invalid/malformed RESP request - send an appropriate error message
    // and close the connection...
    writer
        .write_all(
            format!(
                "-CLIENT: A malformed RESP request was received: {}\r\n",
                error
            )
            .as_bytes(),
        )
        .await?;
    writer.flush().await?;
    Ok(())
}

fn clear_input_buffer(mut input_buffer: BytesMut, request_len: usize) -> BytesMut {
    // If the input buffer has grown in order to accommodate a large request, we shrink it
    // here again. Otherwise we clear the buffer to make room for the next request..
    if input_buffer.capacity() > DEFAULT_BUFFER_SIZE || input_buffer.len() > request_len {
        let previous_buffer = input_buffer;
        input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);

        // If the previous buffer contains trailing data, we transfer it to the new buffer.
        if previous_buffer.len() > request_len {
            input_buffer.put_slice(&previous_buffer[request_len..]);
        }
    } else {
        input_buffer.truncate(0);
    }

    input_buffer
}

/// Executes a single parsed request and produces its response.
async fn handle_request(platform: &Arc<Platform>, request: &Request) -> Response {
    let mut response = Response::new();
    let command = request.command();

    if command.eq_ignore_ascii_case("PING") {
        response.simple("PONG");
    } else if command.eq_ignore_ascii_case("CACHE.GET") {
        cache_get_command(platform, request, &mut response).await;
    } else if command.eq_ignore_ascii_case("CACHE.STATS") {
        cache_stats_command(platform, request, &mut response);
    } else {
        response.error(format!("CLIENT: Unknown command: {}", command));
    }

    response
}

/// Resolves the registry or reports the lack of one as server error.
fn find_registry(platform: &Arc<Platform>, response: &mut Response) -> Option<Arc<Registry>> {
    let registry = platform.find::<Registry>();
    if registry.is_none() {
        response.error("SERVER: No cache registry is installed on this node!");
    }

    registry
}

/// Implements the CACHE.GET command.
async fn cache_get_command(platform: &Arc<Platform>, request: &Request, response: &mut Response) {
    let registry = match find_registry(platform, response) {
        Some(registry) => registry,
        None => return,
    };

    let (group_name, key) = match (request.str_parameter(0), request.str_parameter(1)) {
        (Ok(group_name), Ok(key)) => (group_name, key),
        _ => {
            response.error("CLIENT: CACHE.GET requires a group and a key as parameters!");
            return;
        }
    };

    let group = match registry.find(group_name) {
        Some(group) => group,
        None => {
            response.error(format!("CLIENT: Unknown group: {}", group_name));
            return;
        }
    };

    match group.get(key).await {
        Ok(value) => response.bulk_bytes(value.as_slice()),
        Err(error @ CacheError::EmptyKey) => response.error(format!("CLIENT: {}", error)),
        Err(error) => response.error(format!("SERVER: {}", error)),
    }
}

/// Delegates the CACHE.STATS command to the proper implementation based on its arguments.
fn cache_stats_command(platform: &Arc<Platform>, request: &Request, response: &mut Response) {
    let registry = match find_registry(platform, response) {
        Some(registry) => registry,
        None => return,
    };

    if request.parameter_count() == 0 {
        all_stats_command(platform, &registry, response);
    } else {
        group_stats_command(&registry, request, response);
    }
}

/// Implements the `CACHE.STATS` command.
fn all_stats_command(platform: &Arc<Platform>, registry: &Registry, response: &mut Response) {
    let mut result = String::new();

    result += "Use 'CACHE.STATS <group>' for detailed metrics.\n\n";

    result += format!(
        "{:<30} {:>12} {:>20}\n",
        "Group", "Num Entries", "Allocated Memory"
    )
    .as_str();
    result += SEPARATOR;

    for name in registry.names() {
        if let Some(group) = registry.find(&name) {
            let stats = group.stats();
            result += format!(
                "{:<30} {:>12} {:>20}\n",
                name,
                stats.entries,
                format_size(stats.allocated_memory)
            )
            .as_str();
        }
    }
    result += SEPARATOR;

    if let Some(server) = platform.find::<Server>() {
        result += format!("\n{:<30} {:>32}\n", "Connection", "Commands").as_str();
        result += SEPARATOR;
        for connection in server.connections() {
            result += format!(
                "{:<30} {:>32}\n",
                connection.peer_address, connection.commands
            )
            .as_str();
        }
        result += SEPARATOR;
    }

    response.bulk(result);
}

/// Implements the `CACHE.STATS group` command.
fn group_stats_command(registry: &Registry, request: &Request, response: &mut Response) {
    let group_name = match request.str_parameter(0) {
        Ok(group_name) => group_name,
        Err(_) => {
            response.error("CLIENT: CACHE.STATS expects at most one group as parameter!");
            return;
        }
    };
    let group = match registry.find(group_name) {
        Some(group) => group,
        None => {
            response.error(format!("CLIENT: Unknown group: {}", group_name));
            return;
        }
    };

    let stats = group.stats();
    let mut result = String::new();

    result += format!("{:<30} {:>20}\n", "Num Entries", stats.entries).as_str();
    result += format!(
        "{:<30} {:>20}\n",
        "Allocated Memory",
        format_size(stats.allocated_memory)
    )
    .as_str();
    result += format!(
        "{:<30} {:>20}\n",
        "Max Memory",
        format_size(stats.max_memory)
    )
    .as_str();
    result += format!("{:<30} {:>20}\n", "Reads", stats.reads).as_str();
    result += format!("{:<30} {:>20}\n", "Writes", stats.writes).as_str();
    result += format!("{:<30} {:>18.2} %\n", "Hit Rate", stats.hit_rate).as_str();
    result += format!("{:<30} {:>20}\n", "Loads", stats.loads).as_str();

    response.bulk(result);
}
